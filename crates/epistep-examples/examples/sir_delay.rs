//! S/I/R with a fixed infectious period, expressed as a delayed event.
//!
//! Each newly infected person is scheduled to "recover" a fixed number of
//! steps later. The recovery listener moves them to R. Halfway through, the
//! run is snapshotted and resumed in a fresh simulation to show that the
//! continuation is identical.
//!
//! Run with: `cargo run -p epistep-examples --example sir_delay`

use epistep_core::fixed::{Fixed64, complement_power, f64_to_fixed64};
use epistep_core::id::StateId;
use epistep_core::sim::{Process, Simulation, SimulationBuilder, StepPipeline, process};
use tracing::info;
use tracing_subscriber::EnvFilter;

const POPULATION: usize = 2_000;
const INFECTIOUS_PERIOD: u32 = 7;
const STEPS: u64 = 60;

fn builder() -> Result<SimulationBuilder, Box<dyn std::error::Error>> {
    let mut builder = Simulation::builder();
    builder.seed(7).pipeline(StepPipeline::FireThenTick);
    builder.listener("recover", |ctx, fired, _| {
        ctx.queue_label(fired, "R")?;
        Ok(())
    })?;
    Ok(builder)
}

fn infection(beta: Fixed64) -> Process {
    process(move |ctx, _| {
        let s = ctx.state("S")?;
        let i = ctx.state("I")?;
        let population = ctx.population();
        let infected = population.persons_in_state(i).len() as u32;
        let p = complement_power(beta, infected);
        let newly = ctx.rng().filter(population.persons_in_state(s), p);
        ctx.queue(&newly, i)?;
        ctx.schedule_label(&newly, INFECTIOUS_PERIOD, "recover")?;
        Ok(())
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let beta = f64_to_fixed64(0.0002);
    let mut sim = builder()?.build();
    let initial = (0..POPULATION).map(|i| if i < 5 { "I" } else { "S" });
    sim.initialize(initial, &["S", "I", "R"])?;
    // Seeded cases recover like everyone else.
    let seeded = sim.population().persons_in_state(StateId(1)).to_vec();
    sim.schedule_label(&seeded, INFECTIOUS_PERIOD, "recover")?;

    sim.run(infection(beta), STEPS / 2)?;
    let bytes = sim.snapshot()?;
    info!(time = sim.time(), bytes = bytes.len(), "snapshot taken");

    let mut resumed = builder()?.build();
    resumed.restore(&bytes)?;

    sim.run(infection(beta), STEPS / 2)?;
    resumed.run(infection(beta), STEPS / 2)?;

    println!("original: {:?}", sim.population().state_counts());
    println!("resumed:  {:?}", resumed.population().state_counts());
    println!("identical: {}", sim.state_hash() == resumed.state_hash());
    Ok(())
}
