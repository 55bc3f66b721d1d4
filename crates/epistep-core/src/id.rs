use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// Identifies a scheduled entry in the event scheduler arena.
    pub struct EntryId;
}

/// Identifies a person in the population. Stable for the lifetime of a run.
///
/// Indices are 0-based: the n-th element of the initial-state sequence
/// becomes `PersonId(n)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PersonId(pub u32);

/// Identifies a state in the population's state set (0-based, label order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateId(pub u32);

/// Identifies an event kind registered with the scheduler (0-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub u32);

impl PersonId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl StateId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl EventId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A reference to a state, either by handle, raw index, or label.
///
/// Accepted wherever user input names a state (initialization, label-aware
/// context helpers). Labels resolve by exact match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateRef<'a> {
    Id(StateId),
    Index(u32),
    Label(&'a str),
}

impl From<StateId> for StateRef<'_> {
    fn from(id: StateId) -> Self {
        StateRef::Id(id)
    }
}

impl From<u32> for StateRef<'_> {
    fn from(index: u32) -> Self {
        StateRef::Index(index)
    }
}

impl<'a> From<&'a str> for StateRef<'a> {
    fn from(label: &'a str) -> Self {
        StateRef::Label(label)
    }
}

impl<'a> From<&'a String> for StateRef<'a> {
    fn from(label: &'a String) -> Self {
        StateRef::Label(label.as_str())
    }
}
