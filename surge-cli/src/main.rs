//! Surge CLI - Command-line interface
//!
//! Runs the HLS server and exposes the engine's probing, keyframe,
//! playlist and command-line building steps for inspection.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use surge_core::SurgeError;
use surge_core::tracing_setup::{CliLogLevel, init_tracing};
use tracing::debug;

#[derive(Parser)]
#[command(name = "surge")]
#[command(about = "On-demand HLS transcoding server")]
struct Cli {
    /// Console log level (RUST_LOG overrides it)
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info, global = true)]
    log_level: CliLogLevel,

    /// Directory for the full trace log
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    if let Err(e) = commands::handle_command(cli.command).await {
        debug!("{:#}", e);
        match e.downcast_ref::<SurgeError>() {
            Some(surge) => eprintln!("Error: {}", surge.user_message()),
            None => eprintln!("Error: {e:#}"),
        }
        std::process::exit(1);
    }
    Ok(())
}
