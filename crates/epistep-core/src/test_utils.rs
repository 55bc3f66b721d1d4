//! Shared test helpers for integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use std::cell::RefCell;
use std::rc::Rc;

use crate::fixed::{Delay, Fixed64, Time, complement_power};
use crate::id::{EventId, PersonId};
use crate::sim::{Process, SimConfig, Simulation, StepPipeline, process};

// ===========================================================================
// Fixed-point helper
// ===========================================================================

pub fn fixed(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

// ===========================================================================
// Identifiers
// ===========================================================================

pub fn persons(ids: &[u32]) -> Vec<PersonId> {
    ids.iter().copied().map(PersonId).collect()
}

pub fn sir_labels() -> [&'static str; 3] {
    ["S", "I", "R"]
}

// ===========================================================================
// Simulation builders
// ===========================================================================

/// A simulation over S/I/R with no events, initialized from `initial`.
pub fn sir_sim(initial: &[&str], pipeline: StepPipeline) -> Simulation {
    let mut sim = Simulation::new(SimConfig {
        seed: 42,
        pipeline,
        update_history: 0,
    });
    sim.initialize(initial.iter().copied(), &sir_labels())
        .expect("valid SIR population");
    sim
}

/// Every `(time, persons)` batch delivered to a listener.
pub type FireLog = Rc<RefCell<Vec<(Time, Vec<PersonId>)>>>;

/// A S/I/R simulation with a "recover" event whose listener moves the fired
/// persons to R and records each batch.
pub fn sir_with_recovery(
    initial: &[&str],
    pipeline: StepPipeline,
    seed: u64,
) -> (Simulation, EventId, FireLog) {
    let log: FireLog = Rc::default();
    let sink = Rc::clone(&log);
    let mut builder = Simulation::builder();
    builder.seed(seed).pipeline(pipeline);
    let recover = builder
        .listener("recover", move |ctx, fired, time| {
            sink.borrow_mut().push((time, fired.to_vec()));
            ctx.queue_label(fired, "R")?;
            Ok(())
        })
        .expect("fresh builder");
    let mut sim = builder.build();
    sim.initialize(initial.iter().copied(), &sir_labels())
        .expect("valid SIR population");
    (sim, recover, log)
}

/// `size` persons, the first `infected` of them in I and the rest in S.
pub fn build_large_population(size: usize, infected: usize, seed: u64) -> (Simulation, FireLog) {
    let initial: Vec<&str> = (0..size)
        .map(|i| if i < infected { "I" } else { "S" })
        .collect();
    let (sim, _, log) = sir_with_recovery(&initial, StepPipeline::TickThenFire, seed);
    (sim, log)
}

// ===========================================================================
// Processes
// ===========================================================================

/// Frequency-independent infection: each susceptible person is infected with
/// probability `1 - (1 - beta)^I` and scheduled to recover after
/// `infectious_period` steps.
pub fn infection_process(beta: Fixed64, infectious_period: Delay) -> Process {
    process(move |ctx, _| {
        let s = ctx.state("S")?;
        let i = ctx.state("I")?;
        let population = ctx.population();
        let infected = population.persons_in_state(i).len() as u32;
        if infected == 0 {
            return Ok(());
        }
        let p = complement_power(beta, infected);
        let newly = ctx.rng().filter(population.persons_in_state(s), p);
        ctx.queue(&newly, i)?;
        ctx.schedule_label(&newly, infectious_period, "recover")?;
        Ok(())
    })
}

/// A process that queues `persons` into `label` at step `at`.
pub fn queue_at(at: Time, persons: Vec<PersonId>, label: &'static str) -> Process {
    process(move |ctx, time| {
        if time == at {
            ctx.queue_label(&persons, label)?;
        }
        Ok(())
    })
}
