//! Error types shared by the population store, update queue, scheduler and
//! simulation loop.

/// A caller supplied input the engine cannot accept. Raised eagerly, before
/// any state is mutated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{distinct} distinct initial states but only {labels} state labels")]
    TooManyInitialStates { distinct: usize, labels: usize },

    #[error("duplicate state label '{0}'")]
    DuplicateLabel(String),

    #[error("state label '{0}' is not in the state set")]
    UnknownLabel(String),

    #[error("state index {0} is out of range")]
    UnknownState(u32),

    #[error("event index {0} is not registered")]
    UnknownEvent(u32),

    #[error("event label '{0}' is not registered")]
    UnknownEventLabel(String),

    #[error("duplicate event label '{0}'")]
    DuplicateEvent(String),

    #[error("person {0} is not in the population")]
    UnknownPerson(u32),

    #[error("population has {expected} persons but {got} initial states were given")]
    PopulationSizeMismatch { expected: usize, got: usize },

    #[error("population has not been initialized")]
    NotInitialized,
}

/// Errors surfaced by engine operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SimError {
    /// Invalid input from the caller.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Internal bookkeeping found inconsistent. Unreachable under correct use.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl SimError {
    /// Whether this is a configuration error rather than an invariant violation.
    pub fn is_configuration(&self) -> bool {
        matches!(self, SimError::Config(_))
    }

    /// The underlying configuration error, if any.
    pub fn as_config(&self) -> Option<&ConfigError> {
        match self {
            SimError::Config(e) => Some(e),
            SimError::Invariant(_) => None,
        }
    }
}
