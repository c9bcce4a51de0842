//! Command line front end over the command surface.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::commands::{self, CacheProbeResponse, JobStatusResponse};
use crate::AppState;

#[derive(Parser, Debug)]
#[command(name = "drawscan")]
#[command(about = "Resumable, cached balloon detection for multi-page drawings")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Process a drawing and print its final status
    Submit {
        /// Session the output is written to
        #[arg(long, default_value = "cli")]
        session: String,
        /// Give up waiting after this many seconds (the job is cancelled)
        #[arg(long, default_value_t = 3600)]
        timeout_secs: u64,
        file: PathBuf,
    },
    /// Check whether output for a drawing or content hash is cached
    Probe { target: String },
    /// Run a single job; launched by the supervisor
    Worker {
        #[arg(long)]
        spec: PathBuf,
    },
}

/// Submit `file` and follow the job until it is terminal. Ctrl+C cancels it.
pub async fn submit(
    state: &AppState,
    session: &str,
    file: &Path,
    timeout: Duration,
) -> anyhow::Result<JobStatusResponse> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let file_name = file
        .file_name()
        .and_then(|name| name.to_str())
        .context("File name is not valid UTF-8")?;

    let receipt = commands::submit_job(state, session, file_name, &bytes).await?;
    print_json(&receipt)?;

    let job_id = receipt.job_id;
    let policy = state.supervisor.policy();
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last_message = receipt.status.message;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(job_id = %job_id, "Interrupted, cancelling");
                commands::cancel_job(state, &job_id).await?;
                break;
            }
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(job_id = %job_id, "Timed out waiting for job, cancelling");
                commands::cancel_job(state, &job_id).await?;
                break;
            }
            _ = tokio::time::sleep(policy.poll_interval) => {
                let current = commands::get_job_status(state, &job_id).await?;
                if current.status.message != last_message {
                    tracing::info!(progress = current.status.progress, "{}", current.status.message);
                    last_message = current.status.message.clone();
                }
                if current.status.is_terminal() {
                    break;
                }
            }
        }
    }

    // A terminal record may still be awaiting cache bookkeeping
    let settle = policy.artifact_wait + policy.reader_drain + policy.grace_period;
    state.supervisor.wait_for_terminal(&job_id, settle).await;
    let status = commands::get_job_status(state, &job_id).await?;
    print_json(&status)?;
    Ok(status)
}

/// Probe by content hash, or by the hash of a file's bytes.
pub async fn probe(state: &AppState, target: &str) -> anyhow::Result<CacheProbeResponse> {
    let content_hash = if drawscan_core::is_content_hash(target) {
        target.to_string()
    } else {
        let bytes = tokio::fs::read(target)
            .await
            .with_context(|| format!("Failed to read {}", target))?;
        drawscan_core::content_hash(&bytes)
    };
    let response = commands::probe_cache(state, &content_hash).await?;
    print_json(&response)?;
    Ok(response)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
