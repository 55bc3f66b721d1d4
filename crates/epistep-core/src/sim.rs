//! The simulation context and its step loop.
//!
//! A [`Simulation`] owns the population store, the update queue, the event
//! scheduler and the RNG. Nothing is global: every process and listener
//! reaches shared state through the [`StepContext`] the loop hands it.
//!
//! # Step pipeline
//!
//! Every step runs the user processes in order, then flushes the update
//! queue. Depending on the configured [`StepPipeline`] the scheduler is then
//! ticked and fired (or fired and ticked). The pipeline is fixed for the
//! lifetime of the simulation so step semantics never change mid-run.

use tracing::{debug, info};

use crate::context::StepContext;
use crate::error::{ConfigError, SimError};
use crate::fixed::{Delay, Time};
use crate::id::{EventId, PersonId, StateId, StateRef};
use crate::population::PopulationStore;
use crate::rng::SimRng;
use crate::schedule::{EventScheduler, FireReport};
use crate::update_queue::UpdateQueue;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Order of the scheduler phases within a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StepPipeline {
    /// processes -> flush. The scheduler is never advanced.
    UpdatesOnly,
    /// processes -> flush -> tick -> fire.
    ///
    /// A process scheduling with delay `d` at step `t` fires at step
    /// `t + max(d, 1) - 1`.
    #[default]
    TickThenFire,
    /// processes -> flush -> fire -> tick.
    ///
    /// A process scheduling with delay `d` at step `t` fires at step `t + d`.
    FireThenTick,
}

/// Code-level simulation settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SimConfig {
    /// Seed for the simulation RNG.
    pub seed: u64,
    /// Scheduler phase order, uniform for the whole run.
    pub pipeline: StepPipeline,
    /// Flushed transitions to retain. 0 = no history.
    #[serde(default)]
    pub update_history: usize,
}

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

/// A per-step callback run before the flush.
pub type Process = Box<dyn FnMut(&mut StepContext<'_>, Time) -> Result<(), SimError>>;

/// Box a closure as a [`Process`].
pub fn process<F>(f: F) -> Process
where
    F: FnMut(&mut StepContext<'_>, Time) -> Result<(), SimError> + 'static,
{
    Box::new(f)
}

/// Anything [`Simulation::run`] accepts as its process list: a single
/// process or an ordered sequence of them.
pub trait IntoProcesses {
    fn into_processes(self) -> Vec<Process>;
}

impl IntoProcesses for Process {
    fn into_processes(self) -> Vec<Process> {
        vec![self]
    }
}

impl IntoProcesses for Vec<Process> {
    fn into_processes(self) -> Vec<Process> {
        self
    }
}

// ---------------------------------------------------------------------------
// Simulation state and reports
// ---------------------------------------------------------------------------

/// Mutable loop state tracked by the simulation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SimState {
    /// Last completed step. 0 before the first step.
    pub time: Time,
}

impl SimState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Outcome of a single step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    pub time: Time,
    /// Persons moved by the flush.
    pub flushed: usize,
    pub fired: FireReport,
}

/// Outcome of [`Simulation::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub steps_run: u64,
    pub final_time: Time,
    /// Persons moved across all flushes.
    pub flushed: usize,
    /// Entries fired across all steps.
    pub fired: usize,
}

// ---------------------------------------------------------------------------
// State hash
// ---------------------------------------------------------------------------

/// A simple deterministic hash of simulation state for reproducibility checks.
///
/// Uses FNV-1a (64-bit). Not cryptographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHash(pub u64);

impl StateHash {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    pub fn new() -> Self {
        Self(Self::FNV_OFFSET)
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::FNV_PRIME);
        }
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.write(&v.to_le_bytes());
    }

    pub fn finish(self) -> u64 {
        self.0
    }
}

impl Default for StateHash {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Declares the event kinds and their listeners before the simulation
/// exists. Events are fixed once [`build`](SimulationBuilder::build) runs.
#[derive(Debug, Default)]
pub struct SimulationBuilder {
    config: SimConfig,
    scheduler: EventScheduler,
}

impl SimulationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&mut self, seed: u64) -> &mut Self {
        self.config.seed = seed;
        self
    }

    pub fn pipeline(&mut self, pipeline: StepPipeline) -> &mut Self {
        self.config.pipeline = pipeline;
        self
    }

    pub fn update_history(&mut self, max: usize) -> &mut Self {
        self.config.update_history = max;
        self
    }

    pub fn config(&mut self, config: SimConfig) -> &mut Self {
        self.config = config;
        self
    }

    /// Register an event kind. Returns its ID.
    pub fn register_event(&mut self, label: &str) -> Result<EventId, SimError> {
        Ok(self.scheduler.register_event(label)?)
    }

    /// Attach a listener to a registered event.
    pub fn on_event<F>(&mut self, event: EventId, listener: F) -> Result<&mut Self, SimError>
    where
        F: FnMut(&mut StepContext<'_>, &[PersonId], Time) -> Result<(), SimError> + 'static,
    {
        self.scheduler.add_listener(event, listener)?;
        Ok(self)
    }

    /// Register `label` if needed and attach a listener to it.
    pub fn listener<F>(&mut self, label: &str, listener: F) -> Result<EventId, SimError>
    where
        F: FnMut(&mut StepContext<'_>, &[PersonId], Time) -> Result<(), SimError> + 'static,
    {
        let event = match self.scheduler.event_id(label) {
            Some(id) => id,
            None => self.scheduler.register_event(label)?,
        };
        self.scheduler.add_listener(event, listener)?;
        Ok(event)
    }

    pub fn build(self) -> Simulation {
        Simulation::with_scheduler(self.config, self.scheduler)
    }
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// The explicit simulation context. Owns all engine state.
#[derive(Debug)]
pub struct Simulation {
    pub(crate) config: SimConfig,
    pub(crate) state: SimState,
    pub(crate) population: PopulationStore,
    pub(crate) updates: UpdateQueue,
    pub(crate) scheduler: EventScheduler,
    pub(crate) rng: SimRng,
}

impl Simulation {
    /// A simulation with no events.
    pub fn new(config: SimConfig) -> Self {
        Self::with_scheduler(config, EventScheduler::new())
    }

    pub fn builder() -> SimulationBuilder {
        SimulationBuilder::new()
    }

    fn with_scheduler(config: SimConfig, scheduler: EventScheduler) -> Self {
        Self {
            rng: SimRng::new(config.seed),
            updates: UpdateQueue::with_max_history(config.update_history),
            state: SimState::new(),
            population: PopulationStore::new(),
            scheduler,
            config,
        }
    }

    // -----------------------------------------------------------------------
    // Initialization
    // -----------------------------------------------------------------------

    /// Create the state set and population. If the population already
    /// exists this behaves like [`reset`](Self::reset).
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
        let was_initialized = self.population.is_initialized();
        self.population.initialize(initial_states, state_labels)?;
        self.after_reset(was_initialized);
        info!(
            persons = self.population.population_size(),
            states = self.population.state_count(),
            "population initialized"
        );
        Ok(())
    }

    /// Overwrite every person's current state and start over: pending
    /// updates and scheduled entries are dropped and time rewinds to 0. The
    /// state set, events and RNG stream are kept.
    pub fn reset<'a, I, R>(&mut self, initial_states: I) -> Result<(), SimError>
    where
        I: IntoIterator<Item = R>,
        R: Into<StateRef<'a>>,
    {
        self.population.reset(initial_states)?;
        self.after_reset(true);
        Ok(())
    }

    fn after_reset(&mut self, clear_schedule: bool) {
        self.updates.configure_for(&self.population);
        if clear_schedule {
            self.scheduler.clear_all();
        }
        self.state = SimState::new();
    }

    /// Restart the RNG stream from `seed`.
    pub fn reseed(&mut self, seed: u64) {
        self.config.seed = seed;
        self.rng = SimRng::new(seed);
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Last completed step. 0 before the first step.
    pub fn time(&self) -> Time {
        self.state.time
    }

    pub fn population(&self) -> &PopulationStore {
        &self.population
    }

    pub fn updates(&self) -> &UpdateQueue {
        &self.updates
    }

    pub fn scheduler(&self) -> &EventScheduler {
        &self.scheduler
    }

    pub fn rng(&self) -> &SimRng {
        &self.rng
    }

    pub fn rng_mut(&mut self) -> &mut SimRng {
        &mut self.rng
    }

    // -----------------------------------------------------------------------
    // Direct mutation (outside a step)
    // -----------------------------------------------------------------------

    /// Queue `persons` to move into `target` at the next flush.
    pub fn queue(&mut self, persons: &[PersonId], target: StateId) -> Result<usize, SimError> {
        self.updates.queue(persons, target)
    }

    /// Label-addressed variant of [`queue`](Self::queue).
    pub fn queue_label(&mut self, persons: &[PersonId], target: &str) -> Result<usize, SimError> {
        if persons.is_empty() {
            return Ok(0);
        }
        let target = self.population.resolve(StateRef::Label(target))?;
        self.updates.queue(persons, target)
    }

    /// Apply pending updates now, stamped with the current time.
    pub fn flush(&mut self) -> Result<usize, SimError> {
        self.updates.flush(&mut self.population, self.state.time)
    }

    /// Schedule `event` for `persons` after `delay` steps.
    pub fn schedule(
        &mut self,
        persons: &[PersonId],
        delay: Delay,
        event: EventId,
    ) -> Result<usize, SimError> {
        if let Some(bad) = persons
            .iter()
            .find(|p| !self.population.contains_person(**p))
        {
            return Err(ConfigError::UnknownPerson(bad.0).into());
        }
        self.scheduler.schedule(persons, delay, event)
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
        let event = self
            .scheduler
            .event_id(event)
            .ok_or_else(|| ConfigError::UnknownEventLabel(event.to_string()))?;
        self.schedule(persons, delay, event)
    }

    /// Remove every scheduled entry of `persons`.
    pub fn clear_scheduled(&mut self, persons: &[PersonId]) -> usize {
        self.scheduler.clear(persons)
    }

    /// Decrement every scheduled delay by one.
    pub fn tick_events(&mut self) {
        self.scheduler.tick();
    }

    /// Fire every ready entry at `time`.
    pub fn fire_events(&mut self, time: Time) -> Result<FireReport, SimError> {
        self.scheduler
            .fire(time, &self.population, &mut self.updates, &mut self.rng)
    }

    // -----------------------------------------------------------------------
    // Stepping
    // -----------------------------------------------------------------------

    /// Run `steps` steps, numbered from the current time + 1.
    ///
    /// Aborts on the first error. See [`step`](Self::step) for how far the
    /// failing step got.
    pub fn run(&mut self, processes: impl IntoProcesses, steps: u64) -> Result<RunReport, SimError> {
        let mut processes = processes.into_processes();
        let start = self.state.time;
        info!(
            start = start + 1,
            steps,
            processes = processes.len(),
            pipeline = ?self.config.pipeline,
            "run started"
        );

        let mut report = RunReport {
            final_time: start,
            ..RunReport::default()
        };
        for _ in 0..steps {
            let step = self.step(&mut processes)?;
            report.steps_run += 1;
            report.final_time = step.time;
            report.flushed += step.flushed;
            report.fired += step.fired.total();
        }

        info!(
            final_time = report.final_time,
            flushed = report.flushed,
            fired = report.fired,
            "run finished"
        );
        Ok(report)
    }

    /// Execute one step.
    ///
    /// If a process fails, the work staged by the process pass is discarded
    /// and time does not advance. Once the flush has run the step always
    /// completes: if a listener fails, the scheduler phases finish (see
    /// [`EventScheduler::fire`]), time advances, and the error is returned.
    pub fn step(&mut self, processes: &mut [Process]) -> Result<StepReport, SimError> {
        if !self.population.is_initialized() {
            return Err(ConfigError::NotInitialized.into());
        }
        let time = self.state.time + 1;

        let mut ops = Vec::new();
        {
            let mut ctx = StepContext::new(
                time,
                &self.population,
                &self.scheduler,
                &mut ops,
                &mut self.rng,
            );
            for process in processes.iter_mut() {
                process(&mut ctx, time)?;
            }
        }
        self.scheduler.apply_ops(&mut self.updates, ops)?;

        let flushed = self.updates.flush(&mut self.population, time)?;

        let fired = match self.config.pipeline {
            StepPipeline::UpdatesOnly => Ok(FireReport::default()),
            StepPipeline::TickThenFire => {
                self.scheduler.tick();
                self.fire_events(time)
            }
            StepPipeline::FireThenTick => {
                let fired = self.fire_events(time);
                self.scheduler.tick();
                fired
            }
        };

        self.state.time = time;
        let fired = fired?;
        debug!(time, flushed, fired = fired.total(), "step complete");
        Ok(StepReport {
            time,
            flushed,
            fired,
        })
    }

    // -----------------------------------------------------------------------
    // Invariants and hashing
    // -----------------------------------------------------------------------

    /// Check every internal index.
    pub fn check_invariants(&self) -> Result<(), SimError> {
        self.population.check_invariants()?;
        self.updates.check_invariants()?;
        self.scheduler.check_invariants()
    }

    /// Hash of time, current states, pending updates, scheduled entries and
    /// RNG state.
    pub fn state_hash(&self) -> u64 {
        let mut h = StateHash::new();
        h.write_u64(self.state.time);
        h.write_u64(self.rng.state());
        for state in self.population.current_states() {
            h.write_u32(state.0);
        }
        for (person, state) in self.updates.pending() {
            h.write_u32(person.0);
            h.write_u32(state.0);
        }
        for entry in self.scheduler.all_entries() {
            h.write_u32(entry.person.0);
            h.write_u32(entry.event.0);
            h.write_i64(entry.delay);
        }
        h.finish()
    }
}
