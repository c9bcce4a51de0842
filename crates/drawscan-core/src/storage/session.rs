//! Per-client workspaces.

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::pipeline::Detection;

use super::write_atomic;

const MAX_SESSION_KEY_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid session key")]
    InvalidKey,
    #[error("Invalid file name: {0}")]
    InvalidFileName(String),
    #[error("workspace io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolves session keys to isolated workspace directories.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve (and create on first use) the workspace for `key`.
    ///
    /// Safe to call concurrently for the same key: directory creation is
    /// idempotent and tolerates a racing creator.
    pub async fn resolve(&self, key: &str) -> Result<Workspace, SessionError> {
        if !is_valid_session_key(key) {
            return Err(SessionError::InvalidKey);
        }
        let root = self.root.join(key);
        tokio::fs::create_dir_all(root.join("input")).await?;
        tokio::fs::create_dir_all(root.join("documents")).await?;
        Ok(Workspace {
            key: key.to_string(),
            root,
        })
    }
}

/// Session keys are opaque to us but must be a single, plain path component.
pub fn is_valid_session_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_SESSION_KEY_LEN
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Reduce an uploaded file name to a safe single component.
fn sanitize_file_name(name: &str) -> Option<&str> {
    let name = name.trim();
    if name.is_empty()
        || name == "."
        || name.contains("..")
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return None;
    }
    Some(name)
}

/// A resolved session workspace.
#[derive(Debug, Clone)]
pub struct Workspace {
    key: String,
    root: PathBuf,
}

impl Workspace {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    /// Output directory for one document, keyed by its content hash.
    pub fn document(&self, content_hash: &str) -> DocumentDir {
        DocumentDir::new(self.root.join("documents").join(content_hash))
    }

    /// Persist an uploaded document at `input/<content_hash>/<file_name>`.
    ///
    /// The path is immutable for given content, so re-uploading a file under
    /// the same name never changes what a running worker reads.
    pub async fn store_input(
        &self,
        content_hash: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, SessionError> {
        let name = sanitize_file_name(file_name)
            .ok_or_else(|| SessionError::InvalidFileName(file_name.to_string()))?;
        if !crate::is_content_hash(content_hash) {
            return Err(SessionError::InvalidFileName(content_hash.to_string()));
        }
        let dir = self.input_dir().join(content_hash);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(name);
        write_atomic(&path, bytes).await?;
        Ok(path)
    }
}

/// Outputs for one document: page artifacts plus the results file.
///
/// The same layout is used inside cache entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentDir {
    root: PathBuf,
}

impl DocumentDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn pages_dir(&self) -> PathBuf {
        self.root.join("pages")
    }

    /// Path of the artifact for a 1-based page number.
    pub fn page_path(&self, page: usize) -> PathBuf {
        self.pages_dir().join(format!("page_{:04}.png", page))
    }

    pub fn results_path(&self) -> PathBuf {
        self.root.join("results.json")
    }

    /// Page artifacts in page order.
    pub async fn list_pages(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut pages = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.pages_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(pages),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("page_") && name.ends_with(".png") {
                pages.push(entry.path());
            }
        }
        // Zero padded, so lexical order is page order
        pages.sort();
        Ok(pages)
    }

    pub async fn write_results(&self, results: &[Detection]) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let json = serde_json::to_vec_pretty(results)?;
        write_atomic(&self.results_path(), &json)
            .await
            .context("Failed to write results")?;
        Ok(())
    }

    pub async fn read_results(&self) -> anyhow::Result<Vec<Detection>> {
        let bytes = tokio::fs::read(self.results_path())
            .await
            .context("Failed to read results")?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
