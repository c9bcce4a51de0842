use serde::{Deserialize, Serialize};

use drawscan_core::storage::CacheProbe;
use drawscan_core::{CacheSummary, StatusRecord, SubmitReceipt};

use crate::error::{CommandError, CommandResult};
use crate::AppState;

/// Status of one job as returned to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    #[serde(flatten)]
    pub status: StatusRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelResponse {
    pub job_id: String,
    /// `false` when the job had already finished
    pub cancelled: bool,
}

/// Cache lookup result for a content hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheProbeResponse {
    pub content_hash: String,
    pub hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<CacheSummary>,
}

/// Submit a document for processing in the given session
///
/// Invalid documents are not a command error: they come back as a job that
/// is already terminal with `error_kind = "input"`.
pub async fn submit_job(
    state: &AppState,
    session: &str,
    file_name: &str,
    content: &[u8],
) -> CommandResult<SubmitReceipt> {
    let receipt = state
        .supervisor
        .submit(session, file_name, content)
        .await?;
    tracing::info!(
        job_id = %receipt.job_id,
        cache_hit = receipt.cache_hit,
        state = %receipt.status.state,
        "Submitted {}",
        file_name
    );
    Ok(receipt)
}

/// Get the current status of a job
pub async fn get_job_status(state: &AppState, job_id: &str) -> CommandResult<JobStatusResponse> {
    let status = state
        .supervisor
        .get_status(job_id)
        .await
        .ok_or_else(|| CommandError::job_not_found(job_id))?;
    Ok(JobStatusResponse {
        job_id: job_id.to_string(),
        status,
    })
}

/// Cancel a running job
pub async fn cancel_job(state: &AppState, job_id: &str) -> CommandResult<CancelResponse> {
    if state.supervisor.get_status(job_id).await.is_none() {
        return Err(CommandError::job_not_found(job_id));
    }
    let cancelled = state.supervisor.cancel(job_id).await;
    Ok(CancelResponse {
        job_id: job_id.to_string(),
        cancelled,
    })
}

/// Check whether finished output for a content hash is cached
pub async fn probe_cache(state: &AppState, content_hash: &str) -> CommandResult<CacheProbeResponse> {
    let probe = state.supervisor.probe_cache(content_hash).await?;
    Ok(CacheProbeResponse {
        content_hash: content_hash.to_string(),
        hit: probe.is_hit(),
        summary: match probe {
            CacheProbe::Present(summary) => Some(summary),
            CacheProbe::Absent => None,
        },
    })
}
