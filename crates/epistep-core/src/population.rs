//! The population store: persons, the finite state set, and the
//! current-state relation with a per-state reverse index.
//!
//! Every person has exactly one current state. The reverse index keeps one
//! member list per state plus each person's position inside its list, so a
//! state change is an O(1) swap-remove and push, and a state query borrows
//! the member list directly without scanning the population.

use std::collections::{HashMap, HashSet};

use crate::error::{ConfigError, SimError};
use crate::id::{PersonId, StateId, StateRef};

// ---------------------------------------------------------------------------
// PopulationStore
// ---------------------------------------------------------------------------

/// Owns every person, the state set, and the current-state relation.
#[derive(Debug, Clone, Default)]
pub struct PopulationStore {
    /// State labels indexed by `StateId`.
    labels: Vec<String>,
    label_to_id: HashMap<String, StateId>,
    /// Current state per person, indexed by `PersonId`.
    current: Vec<StateId>,
    /// Position of each person inside `members[current[person]]`.
    position: Vec<u32>,
    /// Persons currently in each state, indexed by `StateId`.
    members: Vec<Vec<PersonId>>,
}

impl PopulationStore {
    /// Create an empty, uninitialized store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the state set has been created.
    pub fn is_initialized(&self) -> bool {
        !self.labels.is_empty()
    }

    // -----------------------------------------------------------------------
    // Initialization
    // -----------------------------------------------------------------------

    /// Create the state set from `state_labels` and one person per element of
    /// `initial_states`.
    ///
    /// Initial states may be given as labels (exact match against
    /// `state_labels`) or as 0-based indices. If the state set already
    /// exists, `state_labels` is ignored and this behaves like [`reset`].
    ///
    /// [`reset`]: PopulationStore::reset
    pub fn initialize<'a, I, R, L>(
        &mut self,
        initial_states: I,
        state_labels: &[L],
    ) -> Result<(), SimError>
    where
        I: IntoIterator<Item = R>,
        R: Into<StateRef<'a>>,
        L: AsRef<str>,
    {
        let initial: Vec<StateRef<'a>> = initial_states.into_iter().map(Into::into).collect();

        let distinct = count_distinct(&initial);
        if distinct > state_labels.len() {
            return Err(ConfigError::TooManyInitialStates {
                distinct,
                labels: state_labels.len(),
            }
            .into());
        }

        if self.is_initialized() {
            return self.reset(initial);
        }

        let mut label_to_id = HashMap::with_capacity(state_labels.len());
        let mut labels = Vec::with_capacity(state_labels.len());
        for (i, label) in state_labels.iter().enumerate() {
            let label = label.as_ref();
            if label_to_id.insert(label.to_string(), StateId(i as u32)).is_some() {
                return Err(ConfigError::DuplicateLabel(label.to_string()).into());
            }
            labels.push(label.to_string());
        }

        let staged = Self {
            labels,
            label_to_id,
            ..Self::default()
        };
        let current = initial
            .iter()
            .map(|r| staged.resolve(*r))
            .collect::<Result<Vec<_>, _>>()?;

        *self = Self::from_parts(staged.labels, staged.label_to_id, current);
        Ok(())
    }

    /// Overwrite every person's current state. The state set is unchanged.
    ///
    /// The number of initial states must equal the population size.
    pub fn reset<'a, I, R>(&mut self, initial_states: I) -> Result<(), SimError>
    where
        I: IntoIterator<Item = R>,
        R: Into<StateRef<'a>>,
    {
        if !self.is_initialized() {
            return Err(ConfigError::NotInitialized.into());
        }
        let initial: Vec<StateRef<'a>> = initial_states.into_iter().map(Into::into).collect();
        if initial.len() != self.population_size() {
            return Err(ConfigError::PopulationSizeMismatch {
                expected: self.population_size(),
                got: initial.len(),
            }
            .into());
        }
        let current = initial
            .iter()
            .map(|r| self.resolve(*r))
            .collect::<Result<Vec<_>, _>>()?;

        let labels = std::mem::take(&mut self.labels);
        let label_to_id = std::mem::take(&mut self.label_to_id);
        *self = Self::from_parts(labels, label_to_id, current);
        Ok(())
    }

    /// Rebuild a store from its labels and a full current-state vector.
    /// Callers must have validated every state against `labels`.
    fn from_parts(
        labels: Vec<String>,
        label_to_id: HashMap<String, StateId>,
        current: Vec<StateId>,
    ) -> Self {
        let mut members = vec![Vec::new(); labels.len()];
        let mut position = Vec::with_capacity(current.len());
        for (i, state) in current.iter().enumerate() {
            let list: &mut Vec<PersonId> = &mut members[state.index()];
            position.push(list.len() as u32);
            list.push(PersonId(i as u32));
        }
        Self {
            labels,
            label_to_id,
            current,
            position,
            members,
        }
    }

    /// Rebuild a store from snapshot data, validating every state index.
    pub(crate) fn restore(labels: Vec<String>, current: Vec<StateId>) -> Result<Self, SimError> {
        let mut label_to_id = HashMap::with_capacity(labels.len());
        for (i, label) in labels.iter().enumerate() {
            if label_to_id.insert(label.clone(), StateId(i as u32)).is_some() {
                return Err(ConfigError::DuplicateLabel(label.clone()).into());
            }
        }
        if let Some(bad) = current.iter().find(|s| s.index() >= labels.len()) {
            return Err(ConfigError::UnknownState(bad.0).into());
        }
        Ok(Self::from_parts(labels, label_to_id, current))
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// Total number of persons.
    pub fn population_size(&self) -> usize {
        self.current.len()
    }

    /// Number of states in the state set.
    pub fn state_count(&self) -> usize {
        self.labels.len()
    }

    /// State labels in state-index order.
    pub fn state_labels(&self) -> &[String] {
        &self.labels
    }

    /// Look up a state by label.
    pub fn state_id(&self, label: &str) -> Option<StateId> {
        self.label_to_id.get(label).copied()
    }

    /// Label of a state, if it exists.
    pub fn label(&self, state: StateId) -> Option<&str> {
        self.labels.get(state.index()).map(String::as_str)
    }

    /// Whether `state` belongs to the state set.
    pub fn contains_state(&self, state: StateId) -> bool {
        state.index() < self.labels.len()
    }

    /// Whether `person` belongs to the population.
    pub fn contains_person(&self, person: PersonId) -> bool {
        person.index() < self.current.len()
    }

    /// Resolve a state reference to a handle.
    pub fn resolve(&self, state: StateRef<'_>) -> Result<StateId, ConfigError> {
        match state {
            StateRef::Id(id) if self.contains_state(id) => Ok(id),
            StateRef::Id(id) => Err(ConfigError::UnknownState(id.0)),
            StateRef::Index(i) if (i as usize) < self.labels.len() => Ok(StateId(i)),
            StateRef::Index(i) => Err(ConfigError::UnknownState(i)),
            StateRef::Label(label) => self
                .state_id(label)
                .ok_or_else(|| ConfigError::UnknownLabel(label.to_string())),
        }
    }

    /// Current state of a person.
    pub fn state_of(&self, person: PersonId) -> Result<StateId, ConfigError> {
        self.current
            .get(person.index())
            .copied()
            .ok_or(ConfigError::UnknownPerson(person.0))
    }

    // -----------------------------------------------------------------------
    // State-indexed queries
    // -----------------------------------------------------------------------

    /// Persons currently in `state`. Empty for an unknown state.
    pub fn persons_in_state(&self, state: StateId) -> &[PersonId] {
        self.members
            .get(state.index())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Persons whose current state is any of `states`.
    ///
    /// Results are grouped by state in the order given; repeated states are
    /// only visited once.
    pub fn persons_in_states(&self, states: &[StateId]) -> Vec<PersonId> {
        let states = dedup_states(states);
        let total = states.iter().map(|s| self.persons_in_state(*s).len()).sum();
        let mut out = Vec::with_capacity(total);
        for state in states {
            out.extend_from_slice(self.persons_in_state(state));
        }
        out
    }

    /// Number of persons whose current state is any of `states`.
    ///
    /// Use [`population_size`](Self::population_size) for the whole population.
    pub fn count_in_states(&self, states: &[StateId]) -> usize {
        dedup_states(states)
            .into_iter()
            .map(|s| self.persons_in_state(s).len())
            .sum()
    }

    /// Label-addressed variant of [`count_in_states`](Self::count_in_states).
    pub fn count_in_labels(&self, labels: &[&str]) -> Result<usize, ConfigError> {
        let states = labels
            .iter()
            .map(|l| self.resolve(StateRef::Label(l)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.count_in_states(&states))
    }

    /// Persons per state, in state-index order.
    pub fn state_counts(&self) -> Vec<usize> {
        self.members.iter().map(Vec::len).collect()
    }

    /// Current state of every person, indexed by `PersonId`.
    pub fn current_states(&self) -> &[StateId] {
        &self.current
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Overwrite the current state of the given persons.
    ///
    /// All pairs are validated before anything changes. A person listed more
    /// than once ends in the state of its last pair.
    pub fn apply<I>(&mut self, target_by_person: I) -> Result<usize, SimError>
    where
        I: IntoIterator<Item = (PersonId, StateId)>,
    {
        let targets: Vec<(PersonId, StateId)> = target_by_person.into_iter().collect();
        for &(person, state) in &targets {
            self.check_person(person)?;
            self.check_state(state)?;
        }
        for &(person, state) in &targets {
            self.move_person(person, state);
        }
        Ok(targets.len())
    }

    /// Move every person in `persons` into `state`.
    pub fn apply_group(&mut self, persons: &[PersonId], state: StateId) -> Result<usize, SimError> {
        self.check_state(state)?;
        for &person in persons {
            self.check_person(person)?;
        }
        for &person in persons {
            self.move_person(person, state);
        }
        Ok(persons.len())
    }

    fn check_person(&self, person: PersonId) -> Result<(), ConfigError> {
        if self.contains_person(person) {
            Ok(())
        } else {
            Err(ConfigError::UnknownPerson(person.0))
        }
    }

    fn check_state(&self, state: StateId) -> Result<(), ConfigError> {
        if self.contains_state(state) {
            Ok(())
        } else {
            Err(ConfigError::UnknownState(state.0))
        }
    }

    fn move_person(&mut self, person: PersonId, to: StateId) {
        let p = person.index();
        let from = self.current[p];
        if from == to {
            return;
        }

        let pos = self.position[p] as usize;
        let list = &mut self.members[from.index()];
        list.swap_remove(pos);
        if let Some(&moved) = list.get(pos) {
            self.position[moved.index()] = pos as u32;
        }

        let list = &mut self.members[to.index()];
        self.position[p] = list.len() as u32;
        list.push(person);
        self.current[p] = to;
    }

    // -----------------------------------------------------------------------
    // Invariants
    // -----------------------------------------------------------------------

    /// Verify that every person appears in exactly one member list, the one
    /// matching its current state.
    pub fn check_invariants(&self) -> Result<(), SimError> {
        let indexed: usize = self.members.iter().map(Vec::len).sum();
        if indexed != self.current.len() {
            return Err(SimError::Invariant(format!(
                "reverse index holds {indexed} entries for {} persons",
                self.current.len()
            )));
        }
        let mut seen = vec![false; self.current.len()];
        for (s, list) in self.members.iter().enumerate() {
            for (pos, person) in list.iter().enumerate() {
                let p = person.index();
                if p >= self.current.len() || seen[p] {
                    return Err(SimError::Invariant(format!(
                        "person {} indexed under more than one state",
                        person.0
                    )));
                }
                seen[p] = true;
                if self.current[p].index() != s || self.position[p] as usize != pos {
                    return Err(SimError::Invariant(format!(
                        "person {} indexed under state {s} but current state is {}",
                        person.0, self.current[p].0
                    )));
                }
            }
        }
        Ok(())
    }
}

fn dedup_states(states: &[StateId]) -> Vec<StateId> {
    let mut seen = HashSet::with_capacity(states.len());
    states.iter().copied().filter(|s| seen.insert(*s)).collect()
}

fn count_distinct(initial: &[StateRef<'_>]) -> usize {
    let mut seen: HashSet<StateRef<'_>> = HashSet::new();
    for r in initial {
        seen.insert(*r);
    }
    seen.len()
}

// ===========================================================================
// Tests
// ===========================================================================
