//! Drawscan Core - resumable, content-cached extraction of numbered
//! balloons from engineering drawings.
//!
//! This crate contains:
//! - Session workspaces, per-content checkpoints and the content cache
//! - The page pipeline (rasterize, detect, crop, extract)
//! - The job supervisor and the worker process protocol

pub mod config;
pub mod error;
pub mod jobs;
pub mod pdf;
pub mod pipeline;
pub mod storage;
pub mod worker;

pub use config::{BackendSettings, CommandSpec, Config, Settings};
pub use error::ErrorKind;
pub use jobs::{
    JobState, ProcessLauncher, StatusRecord, SubmitReceipt, Supervisor, SupervisorError,
    TaskLauncher,
};
pub use storage::{CacheProbe, CacheSummary};

/// Content identity of a document: hex BLAKE3 of its bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Whether `s` has the shape of a [`content_hash`] and is safe as a path
/// component.
pub fn is_content_hash(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
