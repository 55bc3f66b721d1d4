//! The context handed to processes and event listeners.
//!
//! A [`StepContext`] gives read access to the population and the scheduler.
//! Queued updates and scheduling requests are validated immediately but
//! staged. Staged work is committed once the callbacks that produced it have
//! all succeeded: after the whole process pass, or after all listeners of
//! one event. Scheduler changes from a fire pass take effect when the pass
//! ends, so listeners never observe their own scheduling re-entrantly.

use crate::error::{ConfigError, SimError};
use crate::fixed::{Delay, Time};
use crate::id::{EventId, PersonId, StateId, StateRef};
use crate::population::PopulationStore;
use crate::rng::SimRng;
use crate::schedule::EventScheduler;

/// A mutation requested from inside a callback, applied on commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PendingOp {
    Queue {
        persons: Vec<PersonId>,
        target: StateId,
    },
    Schedule {
        persons: Vec<PersonId>,
        delay: Delay,
        event: EventId,
    },
    Clear {
        persons: Vec<PersonId>,
    },
}

/// Per-callback view of the simulation.
pub struct StepContext<'a> {
    time: Time,
    population: &'a PopulationStore,
    scheduler: &'a EventScheduler,
    ops: &'a mut Vec<PendingOp>,
    rng: &'a mut SimRng,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(
        time: Time,
        population: &'a PopulationStore,
        scheduler: &'a EventScheduler,
        ops: &'a mut Vec<PendingOp>,
        rng: &'a mut SimRng,
    ) -> Self {
        Self {
            time,
            population,
            scheduler,
            ops,
            rng,
        }
    }

    /// The step being executed.
    pub fn time(&self) -> Time {
        self.time
    }

    /// The population this callback observes. Processes run before the
    /// step's flush and see the previous step's states; listeners run after
    /// it and see the flushed states.
    pub fn population(&self) -> &'a PopulationStore {
        self.population
    }

    /// The scheduler as of the start of the current phase.
    pub fn scheduler(&self) -> &'a EventScheduler {
        self.scheduler
    }

    /// The simulation's deterministic RNG.
    pub fn rng(&mut self) -> &mut SimRng {
        self.rng
    }

    /// Resolve a state label or index against the population's state set.
    pub fn state<'s>(&self, state: impl Into<StateRef<'s>>) -> Result<StateId, SimError> {
        Ok(self.population.resolve(state.into())?)
    }

    /// Resolve an event label.
    pub fn event(&self, label: &str) -> Result<EventId, SimError> {
        self.scheduler
            .event_id(label)
            .ok_or_else(|| ConfigError::UnknownEventLabel(label.to_string()).into())
    }

    /// Queue `persons` to move into `target` at the next flush.
    ///
    /// Validated now, handed to the update queue on commit.
    pub fn queue(&mut self, persons: &[PersonId], target: StateId) -> Result<usize, SimError> {
        if persons.is_empty() {
            return Ok(0);
        }
        if !self.population.contains_state(target) {
            return Err(ConfigError::UnknownState(target.0).into());
        }
        self.check_persons(persons)?;
        self.ops.push(PendingOp::Queue {
            persons: persons.to_vec(),
            target,
        });
        Ok(persons.len())
    }

    /// Label-addressed variant of [`queue`](Self::queue).
    pub fn queue_label(&mut self, persons: &[PersonId], target: &str) -> Result<usize, SimError> {
        if persons.is_empty() {
            return Ok(0);
        }
        let target = self.state(target)?;
        self.queue(persons, target)
    }

    /// Schedule `event` for every person in `persons` after `delay` steps.
    ///
    /// Validated now, applied to the scheduler on commit.
    pub fn schedule(
        &mut self,
        persons: &[PersonId],
        delay: Delay,
        event: EventId,
    ) -> Result<usize, SimError> {
        if persons.is_empty() {
            return Ok(0);
        }
        if !self.scheduler.contains_event(event) {
            return Err(ConfigError::UnknownEvent(event.0).into());
        }
        self.check_persons(persons)?;
        self.ops.push(PendingOp::Schedule {
            persons: persons.to_vec(),
            delay,
            event,
        });
        Ok(persons.len())
    }

    /// Label-addressed variant of [`schedule`](Self::schedule).
    pub fn schedule_label(
        &mut self,
        persons: &[PersonId],
        delay: Delay,
        event: &str,
    ) -> Result<usize, SimError> {
        if persons.is_empty() {
            return Ok(0);
        }
        let event = self.event(event)?;
        self.schedule(persons, delay, event)
    }

    /// Remove every scheduled entry of `persons` on commit.
    pub fn clear_scheduled(&mut self, persons: &[PersonId]) {
        if !persons.is_empty() {
            self.ops.push(PendingOp::Clear {
                persons: persons.to_vec(),
            });
        }
    }

    fn check_persons(&self, persons: &[PersonId]) -> Result<(), SimError> {
        match persons
            .iter()
            .find(|p| !self.population.contains_person(**p))
        {
            Some(bad) => Err(ConfigError::UnknownPerson(bad.0).into()),
            None => Ok(()),
        }
    }
}
