//! `mlpug` binary: train, resume and inspect experiments from the command line.

mod commands;
mod demo;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// MLPug: training loop orchestration with callbacks, metrics and checkpoints
#[derive(Parser, Debug)]
#[command(name = "mlpug", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (holds `.mlpug/config.toml`)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Train the demo classifier with the configured callback chain
    Train(TrainArgs),
    /// Summarise a model or training checkpoint file
    Inspect {
        /// Checkpoint file to read
        file: PathBuf,
    },
    /// Show or initialise the run configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug, Default)]
pub struct TrainArgs {
    /// Experiment name, used for metric stream directories
    #[arg(short, long)]
    pub experiment: Option<String>,

    /// Number of epochs
    #[arg(long)]
    pub epochs: Option<usize>,

    /// Number of in-process replicas the batches are split over
    #[arg(long)]
    pub replicas: Option<usize>,

    /// Seed for data generation and model initialisation
    #[arg(long)]
    pub seed: Option<u64>,

    /// Directory checkpoints are written to
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Directory TensorBoard event files are written to
    #[arg(long)]
    pub metrics_dir: Option<PathBuf>,

    /// Continue from the latest training checkpoint
    #[arg(long)]
    pub resume: bool,
}

#[derive(clap::Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Write the default configuration to `.mlpug/config.toml`
    Init,
}

/// Stderr output at the level chosen on the command line, plus a JSON run log
/// under the platform data directory. The returned guard flushes the file log.
fn init_tracing(verbose: u8, quiet: bool) -> tracing_appender::non_blocking::WorkerGuard {
    let level = match (verbose, quiet) {
        (0, true) => "error",
        (0, false) => "info",
        (1, _) => "debug",
        _ => "trace",
    };

    let log_dir = directories::ProjectDirs::from("dev", "mlpug", "mlpug")
        .map_or_else(|| PathBuf::from(".mlpug/logs"), |dirs| dirs.data_dir().join("logs"));
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Cannot create log directory {}: {e}", log_dir.display());
    }
    let (run_log, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "mlpug.log"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .with_filter(EnvFilter::new(level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(run_log)
                .with_filter(EnvFilter::new("mlpug=debug,mlpug_core=debug")),
        )
        .init();
    guard
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let _guard = init_tracing(cli.verbose, cli.quiet);

    let workspace = match cli.workspace.canonicalize() {
        Ok(path) => path,
        Err(e) => anyhow::bail!("Workspace {} is not accessible: {e}", cli.workspace.display()),
    };
    commands::handle_command(cli.command, &workspace)
}
