//! Line protocol between the supervisor and a worker process.
//!
//! One JSON object per line. The worker writes [`WorkerMessage`]s to stdout
//! and reads [`ControlMessage`]s from stdin.

use serde::{Deserialize, Serialize};

use crate::jobs::StatusRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Status(StatusRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Stop at the next suspension point
    Cancel,
}

/// Encode as a single newline-terminated line.
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}
