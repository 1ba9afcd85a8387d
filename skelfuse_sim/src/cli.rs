// skelfuse_sim/src/cli.rs

use clap::Parser;
use std::path::PathBuf;

/// Skelfuse: articulated-skeleton sensor-fusion test harness.
///
/// Runs a scripted skeleton through the fusion core, feeding it noisy
/// tracker measurements and reporting how tightly the estimate follows the
/// ground truth.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// The path to the scenario TOML file to run. A built-in arm scenario
    /// is used when omitted.
    #[arg(short, long)]
    pub scenario: Option<PathBuf>,

    /// Override the scenario's frame count.
    #[arg(long)]
    pub frames: Option<usize>,

    /// Override the scenario's random seed.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Override the positional measurement noise sigma, metres.
    #[arg(long)]
    pub position_sigma: Option<f64>,

    /// Override the rotational measurement noise sigma, radians.
    #[arg(long)]
    pub rotation_sigma: Option<f64>,
}
