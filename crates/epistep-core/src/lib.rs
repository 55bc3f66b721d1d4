//! Epistep -- a discrete-time engine for compartmental population models.
//!
//! Every person is in exactly one state of a user-declared state set (for
//! example S/I/R). Model logic queues state changes and schedules future
//! events; nothing becomes visible until the step boundary.
//!
//! # Step Pipeline
//!
//! Each call to [`sim::Simulation::step`] advances time by one step:
//!
//! 1. **Process** -- User processes run in order against the population as
//!    of the previous step. They queue updates and schedule events.
//! 2. **Flush** -- Pending updates are applied, grouped by target state.
//! 3. **Scheduler** -- Depending on [`sim::StepPipeline`], delays are ticked
//!    and ready entries fired (or fired then ticked). Listeners queue further
//!    updates for the next flush.
//!
//! # Key Types
//!
//! - [`sim::Simulation`] -- The explicit context owning all engine state.
//! - [`population::PopulationStore`] -- Current state per person plus a
//!   reverse index from state to members.
//! - [`update_queue::UpdateQueue`] -- One pending target per person, applied
//!   on flush.
//! - [`schedule::EventScheduler`] -- Per-person delayed events with
//!   listeners.
//! - [`context::StepContext`] -- What processes and listeners see.
//! - [`output::CountMatrix`] -- Persons-per-state counts over time.
//! - [`serialize`] -- Versioned snapshots via bitcode.

pub mod context;
pub mod error;
pub mod fixed;
pub mod id;
pub mod output;
pub mod population;
pub mod rng;
pub mod schedule;
pub mod serialize;
pub mod sim;
pub mod update_queue;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
