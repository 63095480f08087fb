//! Tidestream CLI - Command-line interface
//!
//! Streams local files through a simulated swarm and prints read-ahead plans.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tidestream_core::tracing_setup::{CliLogLevel, init_tracing};
use tracing::error;

#[derive(Parser)]
#[command(name = "tidestream")]
#[command(about = "Sequential streaming reads over partially downloaded torrents")]
struct Cli {
    /// Console log level (RUST_LOG takes precedence)
    #[arg(long, global = true, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Directory for the trace-level log of this run
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(error) = init_tracing(cli.log_level.into(), cli.log_dir.as_deref()) {
        eprintln!("Error: failed to set up logging: {error}");
        return ExitCode::FAILURE;
    }

    match commands::handle_command(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("Command failed: {error:#}");
            let (message, code) = commands::failure_report(&error);
            eprintln!("Error: {message}");
            ExitCode::from(code)
        }
    }
}
