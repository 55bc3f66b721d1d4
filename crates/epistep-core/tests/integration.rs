//! Integration tests for the epistep engine.
//!
//! These exercise end-to-end behavior across the public API: deferred
//! updates, delayed events, listener chains, step pipelines, output
//! recording, snapshots and determinism.

use std::cell::RefCell;
use std::rc::Rc;

use epistep_core::error::{ConfigError, SimError};
use epistep_core::id::{PersonId, StateId};
use epistep_core::output::CountMatrix;
use epistep_core::sim::{Process, SimConfig, Simulation, StepPipeline, process};
use epistep_core::test_utils::*;

fn count(sim: &Simulation, label: &str) -> usize {
    sim.population().count_in_labels(&[label]).unwrap()
}

// ===========================================================================
// Deferred updates
// ===========================================================================

#[test]
fn queued_updates_apply_on_flush() {
    let mut sim = sir_sim(&["S", "S", "I"], StepPipeline::TickThenFire);
    sim.queue_label(&persons(&[0, 1]), "I").unwrap();
    assert_eq!(count(&sim, "I"), 1);

    assert_eq!(sim.flush().unwrap(), 2);
    assert_eq!(count(&sim, "I"), 3);
    assert_eq!(count(&sim, "S"), 0);
    assert_eq!(
        sim.population().persons_in_state(StateId(1)).len(),
        3,
        "reverse index follows the flush"
    );
}

#[test]
fn unknown_label_is_configuration_error() {
    let mut sim = sir_sim(&["S", "I"], StepPipeline::TickThenFire);
    let err = sim.queue_label(&persons(&[0]), "X").unwrap_err();
    assert!(err.is_configuration());
    assert_eq!(err.as_config(), Some(&ConfigError::UnknownLabel("X".into())));
    assert!(sim.updates().is_empty());
}

#[test]
fn initialize_rejects_more_states_than_labels() {
    let mut sim = Simulation::new(SimConfig::default());
    let err = sim.initialize(["A", "B", "C"], &["A", "B"]).unwrap_err();
    assert_eq!(
        err,
        SimError::Config(ConfigError::TooManyInitialStates {
            distinct: 3,
            labels: 2
        })
    );
}

#[test]
fn initial_states_by_index() {
    let mut sim = Simulation::new(SimConfig::default());
    sim.initialize([0u32, 2, 2], &sir_labels()).unwrap();
    assert_eq!(sim.population().state_counts(), vec![1, 0, 2]);
}

#[test]
fn reset_rewinds_time_and_drops_pending_work() {
    let (mut sim, recover, _) =
        sir_with_recovery(&["S", "I", "I"], StepPipeline::TickThenFire, 1);
    sim.run(Vec::<Process>::new(), 2).unwrap();
    sim.schedule(&persons(&[1]), 5, recover).unwrap();
    sim.queue_label(&persons(&[0]), "R").unwrap();

    sim.reset(["I", "S", "S"]).unwrap();
    assert_eq!(sim.time(), 0);
    assert!(sim.updates().is_empty());
    assert!(sim.scheduler().is_empty());
    assert_eq!(sim.population().state_counts(), vec![2, 1, 0]);

    let err = sim.reset(["S"]).unwrap_err();
    assert_eq!(
        err,
        SimError::Config(ConfigError::PopulationSizeMismatch {
            expected: 3,
            got: 1
        })
    );
    assert_eq!(sim.population().state_counts(), vec![2, 1, 0]);
}

// ===========================================================================
// Delayed events
// ===========================================================================

#[test]
fn zero_delay_fires_without_tick() {
    let (mut sim, recover, log) = sir_with_recovery(&["I"], StepPipeline::TickThenFire, 1);
    sim.schedule(&persons(&[0]), 0, recover).unwrap();
    let report = sim.fire_events(0).unwrap();
    assert_eq!(report.total(), 1);
    assert_eq!(log.borrow().len(), 1);

    sim.flush().unwrap();
    assert_eq!(count(&sim, "R"), 1);
    assert!(sim.scheduler().is_empty());
}

#[test]
fn delay_two_needs_two_ticks() {
    let (mut sim, recover, log) = sir_with_recovery(&["I", "I"], StepPipeline::TickThenFire, 1);
    sim.schedule(&persons(&[1]), 2, recover).unwrap();

    assert_eq!(sim.fire_events(0).unwrap().total(), 0);
    sim.tick_events();
    assert_eq!(sim.fire_events(1).unwrap().total(), 0);
    sim.tick_events();
    assert_eq!(sim.fire_events(2).unwrap().total(), 1);

    assert_eq!(*log.borrow(), vec![(2, persons(&[1]))]);
    sim.flush().unwrap();
    assert_eq!(sim.population().state_of(PersonId(1)).unwrap(), StateId(2));
    assert_eq!(sim.population().state_of(PersonId(0)).unwrap(), StateId(1));
}

#[test]
fn duplicate_schedules_fire_as_multiset() {
    let (mut sim, recover, log) = sir_with_recovery(&["I", "I"], StepPipeline::TickThenFire, 1);
    sim.schedule(&persons(&[0, 0, 1]), 1, recover).unwrap();
    sim.tick_events();
    sim.fire_events(1).unwrap();
    assert_eq!(*log.borrow(), vec![(1, persons(&[0, 0, 1]))]);
    assert_eq!(
        sim.scheduler().scheduled_for(recover).len(),
        0,
        "fired entries are removed"
    );
}

#[test]
fn clear_scheduled_cancels_recovery() {
    let (mut sim, recover, log) = sir_with_recovery(&["I", "I"], StepPipeline::TickThenFire, 1);
    sim.schedule(&persons(&[0, 1]), 1, recover).unwrap();
    assert_eq!(sim.clear_scheduled(&persons(&[0])), 1);
    sim.run(Vec::<Process>::new(), 3).unwrap();
    assert_eq!(log.borrow().len(), 1);
    assert_eq!(count(&sim, "R"), 1);
    assert_eq!(count(&sim, "I"), 1);
}

// ===========================================================================
// Step pipelines
// ===========================================================================

/// Infect person 0 at step 1 and schedule its recovery after `delay`.
fn infect_first(delay: u32) -> Process {
    process(move |ctx, time| {
        if time == 1 {
            let target = persons(&[0]);
            ctx.queue_label(&target, "I")?;
            ctx.schedule_label(&target, delay, "recover")?;
        }
        Ok(())
    })
}

fn recovery_step(pipeline: StepPipeline, delay: u32) -> u64 {
    let (mut sim, _, log) = sir_with_recovery(&["S"], pipeline, 1);
    sim.run(infect_first(delay), 10).unwrap();
    assert_eq!(count(&sim, "R"), 1);
    let fired = log.borrow();
    assert_eq!(fired.len(), 1);
    fired[0].0
}

#[test]
fn tick_then_fire_timing() {
    assert_eq!(recovery_step(StepPipeline::TickThenFire, 0), 1);
    assert_eq!(recovery_step(StepPipeline::TickThenFire, 1), 1);
    assert_eq!(recovery_step(StepPipeline::TickThenFire, 3), 3);
}

#[test]
fn fire_then_tick_timing() {
    assert_eq!(recovery_step(StepPipeline::FireThenTick, 0), 1);
    assert_eq!(recovery_step(StepPipeline::FireThenTick, 1), 2);
    assert_eq!(recovery_step(StepPipeline::FireThenTick, 3), 4);
}

#[test]
fn updates_only_never_fires() {
    let (mut sim, _, log) = sir_with_recovery(&["S"], StepPipeline::UpdatesOnly, 1);
    sim.run(infect_first(0), 5).unwrap();
    assert!(log.borrow().is_empty());
    assert_eq!(count(&sim, "I"), 1);
    assert_eq!(sim.scheduler().len(), 1);
}

#[test]
fn listener_updates_land_on_next_flush() {
    let (mut sim, _, _) = sir_with_recovery(&["S"], StepPipeline::TickThenFire, 1);
    sim.run(infect_first(3), 3).unwrap();
    assert_eq!(count(&sim, "I"), 1, "recovery queued at step 3 is still pending");
    assert_eq!(sim.updates().pending_count(), 1);
    sim.run(Vec::<Process>::new(), 1).unwrap();
    assert_eq!(count(&sim, "R"), 1);
}

#[test]
fn processes_see_previous_step_state() {
    let (mut sim, _, _) = sir_with_recovery(&["S", "S"], StepPipeline::TickThenFire, 1);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    let observer = process(move |ctx, _| {
        let i = ctx.state("I")?;
        sink.borrow_mut()
            .push(ctx.population().count_in_states(&[i]));
        Ok(())
    });
    sim.run(vec![queue_at(1, persons(&[0, 1]), "I"), observer], 2)
        .unwrap();
    assert_eq!(*seen.borrow(), vec![0, 2]);
}

#[test]
fn listeners_see_flushed_state() {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    let mut builder = Simulation::builder();
    builder
        .listener("observe", move |ctx, _, _| {
            let i = ctx.state("I")?;
            sink.borrow_mut()
                .push(ctx.population().count_in_states(&[i]));
            Ok(())
        })
        .unwrap();
    let mut sim = builder.build();
    sim.initialize(["S"], &sir_labels()).unwrap();
    let infect = process(|ctx, _| {
        let target = persons(&[0]);
        ctx.queue_label(&target, "I")?;
        ctx.schedule_label(&target, 0, "observe")?;
        Ok(())
    });
    sim.run(infect, 1).unwrap();
    assert_eq!(*seen.borrow(), vec![1]);
}

#[test]
fn listener_error_completes_step_and_keeps_failing_entries() {
    let mut builder = Simulation::builder();
    builder
        .listener("fail", |ctx, fired, _| {
            ctx.queue_label(fired, "missing")?;
            Ok(())
        })
        .unwrap();
    let mut sim = builder.build();
    sim.initialize(["S"], &sir_labels()).unwrap();
    sim.schedule_label(&persons(&[0]), 0, "fail").unwrap();

    let err = sim.run(Vec::<Process>::new(), 3).unwrap_err();
    assert_eq!(
        err,
        SimError::Config(ConfigError::UnknownLabel("missing".into()))
    );
    assert_eq!(sim.time(), 1, "flush and tick ran, so the step counts");
    assert_eq!(sim.scheduler().len(), 1, "the failing batch stays scheduled");
    assert!(sim.updates().is_empty());
    sim.check_invariants().unwrap();
}

#[test]
fn earlier_events_commit_when_a_later_listener_fails() {
    let mut builder = Simulation::builder();
    let first = builder
        .listener("first", |ctx, fired, _| {
            ctx.queue_label(fired, "R")?;
            ctx.schedule_label(fired, 3, "follow")?;
            Ok(())
        })
        .unwrap();
    let failing = builder
        .listener("failing", |ctx, fired, _| {
            ctx.schedule_label(fired, 1, "follow")?;
            ctx.queue_label(fired, "nope")?;
            Ok(())
        })
        .unwrap();
    let follow = builder.listener("follow", |_, _, _| Ok(())).unwrap();
    let mut sim = builder.build();
    sim.initialize(["I", "I"], &sir_labels()).unwrap();
    sim.schedule(&persons(&[0]), 0, first).unwrap();
    sim.schedule(&persons(&[1]), 0, failing).unwrap();

    let err = sim.run(Vec::<Process>::new(), 1).unwrap_err();
    assert_eq!(err, SimError::Config(ConfigError::UnknownLabel("nope".into())));
    assert_eq!(sim.time(), 1);

    // The first event is fully committed: update queued, follow-up scheduled.
    assert_eq!(sim.updates().pending(), vec![(PersonId(0), StateId(2))]);
    assert!(sim.scheduler().scheduled_for(first).is_empty());
    assert_eq!(sim.scheduler().entries_for(PersonId(0)), vec![(follow, 3)]);

    // The failing event left no partial work and keeps its entry.
    assert_eq!(sim.scheduler().entries_for(PersonId(1)), vec![(failing, -1)]);
    sim.check_invariants().unwrap();
}

#[test]
fn process_error_discards_staged_work() {
    let (mut sim, _, _) = sir_with_recovery(&["S", "S"], StepPipeline::TickThenFire, 1);
    let failing = process(|ctx, _| {
        let target = persons(&[0]);
        ctx.queue_label(&target, "I")?;
        ctx.schedule_label(&target, 2, "recover")?;
        ctx.queue_label(&target, "Z")?;
        Ok(())
    });
    let err = sim.run(failing, 1).unwrap_err();
    assert_eq!(err.as_config(), Some(&ConfigError::UnknownLabel("Z".into())));
    assert_eq!(sim.time(), 0);
    assert!(sim.updates().is_empty());
    assert!(sim.scheduler().is_empty());
}

// ===========================================================================
// Epidemic run, output and determinism
// ===========================================================================

fn epidemic(seed: u64, steps: u64) -> (Simulation, Rc<RefCell<CountMatrix>>) {
    let (mut sim, _) = build_large_population(500, 5, seed);
    let matrix = CountMatrix::shared();
    sim.run(
        vec![
            CountMatrix::recorder(&matrix),
            infection_process(fixed(0.002), 4),
        ],
        steps,
    )
    .unwrap();
    (sim, matrix)
}

#[test]
fn epidemic_conserves_population() {
    let (sim, matrix) = epidemic(7, 60);
    sim.check_invariants().unwrap();
    let m = matrix.borrow();
    assert_eq!(m.len(), 60);
    assert_eq!(m.labels(), ["S", "I", "R"]);
    assert_eq!(m.times().first(), Some(&1));
    assert!(m.rows().iter().all(|r| r.iter().sum::<usize>() == 500));
    assert_eq!(m.row(1), Some(&[495, 5, 0][..]));

    let susceptible = m.column("S").unwrap();
    assert!(
        susceptible.windows(2).all(|w| w[1] <= w[0]),
        "nobody returns to S"
    );
    let recovered = m.column("R").unwrap();
    assert!(recovered.windows(2).all(|w| w[1] >= w[0]));
}

#[test]
fn same_seed_same_trajectory() {
    let (a, ma) = epidemic(99, 40);
    let (b, mb) = epidemic(99, 40);
    assert_eq!(a.state_hash(), b.state_hash());
    assert_eq!(*ma.borrow(), *mb.borrow());
}

#[test]
fn different_seed_changes_rng_state() {
    let (a, _) = epidemic(1, 20);
    let (b, _) = epidemic(2, 20);
    assert_ne!(a.rng().state(), b.rng().state());
}

#[test]
fn snapshot_round_trip_continues_identically() {
    let (mut original, _) = build_large_population(200, 10, 3);
    original
        .run(infection_process(fixed(0.01), 3), 5)
        .unwrap();
    let bytes = original.snapshot().unwrap();

    let (mut restored, _) = build_large_population(200, 0, 12345);
    restored.restore(&bytes).unwrap();
    assert_eq!(restored.time(), 5);
    assert_eq!(restored.state_hash(), original.state_hash());

    original.run(infection_process(fixed(0.01), 3), 10).unwrap();
    restored.run(infection_process(fixed(0.01), 3), 10).unwrap();
    assert_eq!(restored.state_hash(), original.state_hash());
    assert_eq!(
        restored.population().state_counts(),
        original.population().state_counts()
    );
}

#[test]
fn update_history_records_transitions() {
    let mut builder = Simulation::builder();
    builder.update_history(16);
    let mut sim = builder.build();
    sim.initialize(["S", "S"], &sir_labels()).unwrap();
    sim.run(queue_at(2, persons(&[1]), "I"), 3).unwrap();
    let history = sim.updates().history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].time, 2);
    assert_eq!(history[0].person, PersonId(1));
    assert_eq!(history[0].state, StateId(1));
}
