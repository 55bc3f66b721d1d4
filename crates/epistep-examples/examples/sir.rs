//! Markovian S/I/R model driven entirely by per-step processes.
//!
//! Infection uses the force of infection `1 - (1 - beta)^I`; recovery is a
//! constant per-step probability. The state counts are recorded every step
//! and printed as JSON at the end.
//!
//! Run with: `RUST_LOG=debug cargo run -p epistep-examples --example sir`

use epistep_core::fixed::{complement_power, f64_to_fixed64};
use epistep_core::output::CountMatrix;
use epistep_core::sim::{SimConfig, Simulation, StepPipeline, process};
use tracing::info;
use tracing_subscriber::EnvFilter;

const POPULATION: usize = 1_000;
const SEEDED: usize = 10;
const STEPS: u64 = 120;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let beta = f64_to_fixed64(0.0004);
    let gamma = f64_to_fixed64(0.1);

    let mut sim = Simulation::new(SimConfig {
        seed: 2024,
        pipeline: StepPipeline::UpdatesOnly,
        update_history: 0,
    });
    let initial = (0..POPULATION).map(|i| if i < SEEDED { "I" } else { "S" });
    sim.initialize(initial, &["S", "I", "R"])?;

    let infection = process(move |ctx, _| {
        let s = ctx.state("S")?;
        let i = ctx.state("I")?;
        let population = ctx.population();
        let infected = population.persons_in_state(i).len() as u32;
        let p = complement_power(beta, infected);
        let newly = ctx.rng().filter(population.persons_in_state(s), p);
        ctx.queue(&newly, i)?;
        Ok(())
    });
    let recovery = process(move |ctx, _| {
        let i = ctx.state("I")?;
        let r = ctx.state("R")?;
        let population = ctx.population();
        let recovered = ctx.rng().filter(population.persons_in_state(i), gamma);
        ctx.queue(&recovered, r)?;
        Ok(())
    });

    let matrix = CountMatrix::shared();
    let report = sim.run(
        vec![CountMatrix::recorder(&matrix), infection, recovery],
        STEPS,
    )?;

    let counts = sim.population().state_counts();
    info!(
        steps = report.steps_run,
        flushed = report.flushed,
        susceptible = counts[0],
        infected = counts[1],
        recovered = counts[2],
        "epidemic finished"
    );

    let peak = matrix
        .borrow()
        .column("I")
        .and_then(|c| c.into_iter().max())
        .unwrap_or(0);
    println!("peak infected: {peak}");
    println!("{}", serde_json::to_string(&*matrix.borrow())?);
    Ok(())
}
