use std::time::Duration;

use clap::Parser;
use drawscan_core::{Config, JobState};
use drawscan_lib::cli::{self, Cli, Command};
use drawscan_lib::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    drawscan_lib::init_logging(&["drawscan=info", "drawscan_lib=info", "drawscan_core=info"]);

    match args.command {
        Command::Worker { spec } => {
            let record = drawscan_core::worker::run(&spec).await?;
            tracing::debug!(state = %record.state, "Worker done");
        }
        Command::Submit {
            session,
            timeout_secs,
            file,
        } => {
            let state = AppState::open(Config::load_or_default())?;
            let status =
                cli::submit(&state, &session, &file, Duration::from_secs(timeout_secs)).await?;
            state.supervisor.shutdown().await;
            if status.status.state != JobState::Complete {
                std::process::exit(1);
            }
        }
        Command::Probe { target } => {
            let state = AppState::open(Config::load_or_default())?;
            cli::probe(&state, &target).await?;
        }
    }
    Ok(())
}
