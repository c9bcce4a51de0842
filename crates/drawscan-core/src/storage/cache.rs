//! Global content-addressed cache of finished pipeline outputs.
//!
//! Entries are shared by all sessions and keyed by the content hash of the
//! submitted document. An entry becomes visible in a single rename once every
//! artifact, including `meta.json`, is on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, IoContext};

use super::{copy_files, write_atomic, DocumentDir, Workspace};

const STAGING_DIR: &str = ".staging";

/// What a cache hit reports without copying anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSummary {
    pub content_hash: String,
    pub detections_count: usize,
    pub page_count: usize,
    pub processed_at: DateTime<Utc>,
}

/// On-disk `meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheMeta {
    #[serde(flatten)]
    summary: CacheSummary,
    /// blake3 over results.json and every page artifact, in page order
    digest: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheProbe {
    Absent,
    Present(CacheSummary),
}

impl CacheProbe {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheProbe::Present(_))
    }

    pub fn summary(&self) -> Option<&CacheSummary> {
        match self {
            CacheProbe::Present(summary) => Some(summary),
            CacheProbe::Absent => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed(CacheSummary),
    /// Another writer published first; our copy was discarded
    AlreadyPresent(CacheSummary),
}

impl CommitOutcome {
    pub fn summary(&self) -> &CacheSummary {
        match self {
            CommitOutcome::Committed(s) | CommitOutcome::AlreadyPresent(s) => s,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContentCache {
    root: PathBuf,
    /// Per-hash commit locks; no locking across different content
    commit_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ContentCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            commit_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn entry(&self, content_hash: &str) -> DocumentDir {
        DocumentDir::new(self.root.join(content_hash))
    }

    fn meta_path(&self, content_hash: &str) -> PathBuf {
        self.root.join(content_hash).join("meta.json")
    }

    async fn read_meta(&self, content_hash: &str) -> Result<CacheMeta, CacheError> {
        let path = self.meta_path(content_hash);
        let bytes = tokio::fs::read(&path).await.cache_io(&path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Check for a complete entry. Partial or unreadable entries are absent.
    pub async fn probe(&self, content_hash: &str) -> CacheProbe {
        let Ok(meta) = self.read_meta(content_hash).await else {
            return CacheProbe::Absent;
        };
        let entry = self.entry(content_hash);
        if !tokio::fs::try_exists(entry.results_path()).await.unwrap_or(false) {
            return CacheProbe::Absent;
        }
        match entry.list_pages().await {
            Ok(pages) if !pages.is_empty() && pages.len() == meta.summary.page_count => {
                CacheProbe::Present(meta.summary)
            }
            _ => CacheProbe::Absent,
        }
    }

    /// Copy a cached output into the session's document directory.
    ///
    /// The copy lands in a staging directory inside the workspace and is only
    /// swapped into place once it verifies, so a failure leaves the
    /// destination untouched.
    pub async fn materialize(
        &self,
        content_hash: &str,
        workspace: &Workspace,
    ) -> Result<DocumentDir, CacheError> {
        if !self.probe(content_hash).await.is_hit() {
            return Err(CacheError::Missing(content_hash.to_string()));
        }
        let meta = self.read_meta(content_hash).await?;
        let entry = self.entry(content_hash);

        let stored = digest_document(&entry).await.cache_io(entry.path())?;
        if stored != meta.digest {
            tracing::warn!(content_hash, "Cache entry failed verification, evicting");
            let _ = tokio::fs::remove_dir_all(entry.path()).await;
            return Err(CacheError::DigestMismatch(content_hash.to_string()));
        }

        let staging_root = workspace
            .path()
            .join(format!(".incoming-{}", uuid::Uuid::new_v4().simple()));
        let staging = DocumentDir::new(&staging_root);
        let dest = workspace.document(content_hash);

        let result = async {
            copy_document(&entry, &staging).await?;
            let copied = digest_document(&staging).await.cache_io(&staging_root)?;
            if copied != meta.digest {
                return Err(CacheError::DigestMismatch(content_hash.to_string()));
            }
            replace_dir(&staging_root, dest.path()).await
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_dir_all(&staging_root).await;
            return Err(e);
        }

        tracing::info!(
            content_hash,
            session = workspace.key(),
            detections = meta.summary.detections_count,
            "Materialized cached output"
        );
        Ok(dest)
    }

    /// Publish a finished output. First writer wins.
    pub async fn commit(
        &self,
        content_hash: &str,
        source: &DocumentDir,
        result_count: usize,
    ) -> Result<CommitOutcome, CacheError> {
        let lock = self.lock_for(content_hash);
        let outcome = {
            let _guard = lock.lock().await;
            self.commit_locked(content_hash, source, result_count).await
        };
        drop(lock);
        self.release_lock(content_hash);
        outcome
    }

    async fn commit_locked(
        &self,
        content_hash: &str,
        source: &DocumentDir,
        result_count: usize,
    ) -> Result<CommitOutcome, CacheError> {
        if let CacheProbe::Present(summary) = self.probe(content_hash).await {
            tracing::debug!(content_hash, "Cache entry already present, skipping commit");
            return Ok(CommitOutcome::AlreadyPresent(summary));
        }

        let pages = source.list_pages().await.cache_io(source.path())?;
        if pages.is_empty() || !tokio::fs::try_exists(source.results_path()).await.unwrap_or(false)
        {
            return Err(CacheError::IncompleteSource(content_hash.to_string()));
        }

        let staging_root = self.root.join(STAGING_DIR).join(format!(
            "{}-{}",
            content_hash,
            uuid::Uuid::new_v4().simple()
        ));
        let staging = DocumentDir::new(&staging_root);
        let summary = CacheSummary {
            content_hash: content_hash.to_string(),
            detections_count: result_count,
            page_count: pages.len(),
            processed_at: Utc::now(),
        };

        let result = async {
            copy_document(source, &staging).await?;
            let digest = digest_document(&staging).await.cache_io(&staging_root)?;
            let meta = CacheMeta {
                summary: summary.clone(),
                digest,
            };
            // meta.json last: it is what makes the entry count as present
            let meta_path = staging_root.join("meta.json");
            write_atomic(&meta_path, &serde_json::to_vec_pretty(&meta)?)
                .await
                .cache_io(&meta_path)?;
            self.publish(content_hash, &staging_root).await
        }
        .await;

        match result {
            Ok(None) => {
                tracing::info!(
                    content_hash,
                    detections = result_count,
                    pages = summary.page_count,
                    "Committed cache entry"
                );
                Ok(CommitOutcome::Committed(summary))
            }
            Ok(Some(existing)) => {
                let _ = tokio::fs::remove_dir_all(&staging_root).await;
                Ok(CommitOutcome::AlreadyPresent(existing))
            }
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&staging_root).await;
                Err(e)
            }
        }
    }

    /// Rename the staged entry into place. Returns the winning summary when
    /// another process published the same hash first.
    async fn publish(
        &self,
        content_hash: &str,
        staging_root: &Path,
    ) -> Result<Option<CacheSummary>, CacheError> {
        let final_path = self.root.join(content_hash);
        if tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
            // Probe said absent under our lock, so this is a torn leftover
            tracing::warn!(content_hash, "Replacing incomplete cache entry");
            tokio::fs::remove_dir_all(&final_path)
                .await
                .cache_io(&final_path)?;
        }

        match tokio::fs::rename(staging_root, &final_path).await {
            Ok(()) => Ok(None),
            Err(e) => match self.probe(content_hash).await {
                CacheProbe::Present(existing) => Ok(Some(existing)),
                CacheProbe::Absent => Err(e).cache_io(&final_path),
            },
        }
    }

    fn lock_for(&self, content_hash: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .commit_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(content_hash.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release_lock(&self, content_hash: &str) {
        let mut locks = self
            .commit_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(lock) = locks.get(content_hash) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(content_hash);
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

async fn copy_document(from: &DocumentDir, to: &DocumentDir) -> Result<(), CacheError> {
    let pages_dir = to.pages_dir();
    copy_files(&from.pages_dir(), &pages_dir)
        .await
        .cache_io(&pages_dir)?;
    let results = to.results_path();
    tokio::fs::copy(from.results_path(), &results)
        .await
        .cache_io(&results)?;
    Ok(())
}

async fn replace_dir(staging: &Path, dest: &Path) -> Result<(), CacheError> {
    if tokio::fs::try_exists(dest).await.unwrap_or(false) {
        tokio::fs::remove_dir_all(dest).await.cache_io(dest)?;
    }
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.cache_io(parent)?;
    }
    tokio::fs::rename(staging, dest).await.cache_io(dest)
}

/// blake3 over the results file and every page artifact, in page order.
pub(crate) async fn digest_document(doc: &DocumentDir) -> std::io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&tokio::fs::read(doc.results_path()).await?);
    for page in doc.list_pages().await? {
        if let Some(name) = page.file_name() {
            hasher.update(name.to_string_lossy().as_bytes());
        }
        hasher.update(&tokio::fs::read(&page).await?);
    }
    Ok(hasher.finalize().to_hex().to_string())
}
