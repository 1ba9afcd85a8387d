// skelfuse_sim/src/main.rs

mod cli;
mod config;
mod error;
mod scenario;

use clap::Parser;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::config::ScenarioConfig;
use crate::error::SimError;
use crate::scenario::Harness;

fn main() -> Result<(), SimError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = match &cli.scenario {
        Some(path) => ScenarioConfig::from_path(path)?,
        None => ScenarioConfig::builtin_arm(),
    };

    let frames = cli.frames.unwrap_or(config.simulation.frames);
    let seed = cli.seed.or(config.simulation.seed).unwrap_or(0);
    let position_sigma = cli.position_sigma.unwrap_or(config.noise.position_sigma);
    let rotation_sigma = cli.rotation_sigma.unwrap_or(config.noise.rotation_sigma);

    info!(
        nodes = config.nodes.len(),
        frames, seed, position_sigma, rotation_sigma, "scenario loaded"
    );

    let mut harness = Harness::from_config(&config)?;
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    harness.run(
        frames,
        config.simulation.dt,
        position_sigma,
        rotation_sigma,
        &mut rng,
    )?;
    Ok(())
}
