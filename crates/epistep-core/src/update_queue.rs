//! Deferred state transitions.
//!
//! Processes and listeners queue target states during a step; nothing in the
//! population changes until [`UpdateQueue::flush`] runs at the step boundary.
//! Each person holds at most one pending target, so queuing the same person
//! twice keeps only the last target.

use tracing::debug;

use crate::error::{ConfigError, SimError};
use crate::fixed::Time;
use crate::id::{PersonId, StateId};
use crate::population::PopulationStore;

/// A flushed transition, kept when history tracking is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Transition {
    pub time: Time,
    pub person: PersonId,
    pub state: StateId,
}

// ---------------------------------------------------------------------------
// UpdateQueue
// ---------------------------------------------------------------------------

/// Pending target states, one slot per person.
///
/// Supports optional history tracking of flushed transitions.
#[derive(Debug, Clone, Default)]
pub struct UpdateQueue {
    /// Pending target per person. `None` means no pending update.
    pending: Vec<Option<StateId>>,
    /// Persons with a pending target, in first-queued order.
    touched: Vec<PersonId>,
    /// Number of states a target may refer to.
    state_count: usize,
    /// Flushed transitions, oldest first.
    history: Vec<Transition>,
    /// Maximum history entries to retain. 0 = no history.
    max_history: usize,
}

impl UpdateQueue {
    /// Create an empty queue with no history tracking. Call
    /// [`configure`](Self::configure) before queuing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty queue that retains up to `max_history` transitions.
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            max_history,
            ..Self::default()
        }
    }

    /// Size the queue for a population and state set. Drops every pending
    /// update.
    pub fn configure(&mut self, population_size: usize, state_count: usize) {
        self.pending = vec![None; population_size];
        self.touched.clear();
        self.state_count = state_count;
    }

    /// Size the queue to match `store`.
    pub fn configure_for(&mut self, store: &PopulationStore) {
        self.configure(store.population_size(), store.state_count());
    }

    /// Set the pending target of every person in `persons` to `target`,
    /// overwriting any earlier target for the same person.
    ///
    /// Returns the number of persons queued. An empty `persons` is a no-op.
    pub fn queue(&mut self, persons: &[PersonId], target: StateId) -> Result<usize, SimError> {
        if persons.is_empty() {
            return Ok(0);
        }
        if target.index() >= self.state_count {
            return Err(ConfigError::UnknownState(target.0).into());
        }
        if let Some(bad) = persons.iter().find(|p| p.index() >= self.pending.len()) {
            return Err(ConfigError::UnknownPerson(bad.0).into());
        }

        for &person in persons {
            let slot = &mut self.pending[person.index()];
            if slot.is_none() {
                self.touched.push(person);
            }
            *slot = Some(target);
        }
        Ok(persons.len())
    }

    /// Pending target of a person, if any.
    pub fn pending_for(&self, person: PersonId) -> Option<StateId> {
        self.pending.get(person.index()).copied().flatten()
    }

    /// Number of persons with a pending target.
    pub fn pending_count(&self) -> usize {
        self.touched.len()
    }

    /// Whether no person has a pending target.
    pub fn is_empty(&self) -> bool {
        self.touched.is_empty()
    }

    /// Pending `(person, target)` pairs in first-queued order.
    pub fn pending(&self) -> Vec<(PersonId, StateId)> {
        self.touched
            .iter()
            .filter_map(|&p| self.pending_for(p).map(|s| (p, s)))
            .collect()
    }

    /// Drop every pending target without applying it.
    pub fn clear(&mut self) {
        for person in self.touched.drain(..) {
            self.pending[person.index()] = None;
        }
    }

    /// Apply every pending target to `store`, grouped by target state in
    /// state-index order, then clear the queue.
    ///
    /// Returns the number of persons applied.
    pub fn flush(&mut self, store: &mut PopulationStore, time: Time) -> Result<usize, SimError> {
        if self.touched.is_empty() {
            return Ok(0);
        }
        if store.population_size() != self.pending.len() || store.state_count() != self.state_count
        {
            return Err(SimError::Invariant(format!(
                "update queue sized for {} persons and {} states, store has {} and {}",
                self.pending.len(),
                self.state_count,
                store.population_size(),
                store.state_count()
            )));
        }

        let mut groups: Vec<Vec<PersonId>> = vec![Vec::new(); self.state_count];
        for &person in &self.touched {
            if let Some(target) = self.pending[person.index()] {
                groups[target.index()].push(person);
            }
        }

        let mut applied = 0;
        for (state, group) in groups.iter().enumerate() {
            if group.is_empty() {
                continue;
            }
            let state = StateId(state as u32);
            applied += store.apply_group(group, state)?;
            if self.max_history > 0 {
                self.history
                    .extend(group.iter().map(|&person| Transition { time, person, state }));
            }
        }

        self.clear();
        self.trim_history();

        debug!(time, applied, "flushed pending updates");
        Ok(applied)
    }

    /// Verify that the pending slots and the touched list agree.
    pub fn check_invariants(&self) -> Result<(), SimError> {
        let occupied = self.pending.iter().filter(|s| s.is_some()).count();
        if occupied != self.touched.len() {
            return Err(SimError::Invariant(format!(
                "{occupied} pending slots set but {} persons tracked",
                self.touched.len()
            )));
        }
        Ok(())
    }

    fn trim_history(&mut self) {
        let excess = self.history.len().saturating_sub(self.max_history);
        if excess > 0 {
            self.history.drain(..excess);
        }
    }

    /// Flushed transitions, oldest first.
    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Clear all history entries.
    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
