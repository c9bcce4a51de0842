//! Durable on-disk state.
//!
//! ```text
//! <data_dir>/
//! ├── sessions/<key>/                    SessionStore (per client)
//! │   ├── input/<file>.pdf
//! │   └── documents/<hash>/
//! │       ├── pages/page_0001.png
//! │       └── results.json
//! ├── checkpoints/<hash>/                CheckpointStore (per content)
//! │   ├── checkpoint.json
//! │   └── partial_results.json
//! └── cache/                             ContentCache (per content)
//!     ├── .staging/<hash>-<uuid>/
//!     └── <hash>/{pages/, results.json, meta.json}
//! ```
//!
//! Every file that a reader may observe is written to a uniquely named
//! temporary sibling and renamed into place.

pub mod cache;
pub mod checkpoint;
pub mod session;

pub use cache::{CacheProbe, CacheSummary, CommitOutcome, ContentCache};
pub use checkpoint::{Checkpoint, CheckpointState, CheckpointStore};
pub use session::{DocumentDir, SessionError, SessionStore, Workspace};

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;

/// Write `bytes` to `path` so that readers see either the old or the new
/// content, never a prefix.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = temp_sibling(path);
    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

/// Unique temporary path next to `path`. Unique so concurrent writers of the
/// same file never share a temp file.
pub(crate) fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    path.with_file_name(name)
}

/// Poll until `path` exists or `timeout` elapses.
pub async fn wait_for_file(path: &Path, timeout: Duration, poll: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll.min(deadline.saturating_duration_since(Instant::now()))).await;
    }
}

/// Copy every regular file of `src` into `dst` (non-recursive).
pub(crate) async fn copy_files(src: &Path, dst: &Path) -> std::io::Result<usize> {
    tokio::fs::create_dir_all(dst).await?;
    let mut entries = tokio::fs::read_dir(src).await?;
    let mut copied = 0;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            tokio::fs::copy(entry.path(), dst.join(entry.file_name())).await?;
            copied += 1;
        }
    }
    Ok(copied)
}
