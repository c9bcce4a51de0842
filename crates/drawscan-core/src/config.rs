use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::jobs::SupervisorPolicy;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Root data directory (~/.local/share/drawscan)
    pub data_dir: PathBuf,
    /// Per-session workspaces
    pub sessions_dir: PathBuf,
    /// Content-addressed cache of finished outputs
    pub cache_dir: PathBuf,
    /// Per-content checkpoints
    pub checkpoints_dir: PathBuf,
    /// Per-job scratch directories (worker spec, renders, crops)
    pub jobs_dir: PathBuf,
    /// User settings file
    pub settings_file: PathBuf,
}

impl Config {
    /// Load configuration or use defaults
    pub fn load_or_default() -> Self {
        let data_dir = std::env::var_os("DRAWSCAN_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("drawscan")
            });
        Self::with_data_dir(data_dir)
    }

    /// Lay out all directories below the given root.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            sessions_dir: data_dir.join("sessions"),
            cache_dir: data_dir.join("cache"),
            checkpoints_dir: data_dir.join("checkpoints"),
            jobs_dir: data_dir.join("jobs"),
            settings_file: data_dir.join("settings.json"),
            data_dir,
        }
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.sessions_dir)?;
        std::fs::create_dir_all(&self.cache_dir)?;
        std::fs::create_dir_all(&self.checkpoints_dir)?;
        std::fs::create_dir_all(&self.jobs_dir)?;
        Ok(())
    }
}

/// External command used for a pipeline collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }
}

/// Commands backing the rasterizer, detector and extractor in the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// poppler's `pdftoppm`, invoked once per page
    pub rasterizer: CommandSpec,
    /// Receives a page image path, prints a JSON array of boxes
    pub detector: CommandSpec,
    /// Receives a crop image path, prints the value read from it
    pub extractor: CommandSpec,
    /// Keep only ASCII digits of the extractor output
    pub digits_only: bool,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            rasterizer: CommandSpec::new("pdftoppm"),
            detector: CommandSpec::new("drawscan-detect"),
            extractor: CommandSpec::new("drawscan-read"),
            digits_only: true,
        }
    }
}

/// User-tunable settings persisted as JSON.
///
/// Missing fields fall back to their defaults, so older files keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Rasterization resolution
    pub dpi: u32,
    /// Largest accepted upload
    pub max_upload_bytes: usize,
    pub poll_interval_ms: u64,
    pub grace_period_ms: u64,
    pub artifact_wait_ms: u64,
    pub reader_drain_ms: u64,
    /// Program launched as the worker; defaults to the running executable
    pub worker_program: Option<PathBuf>,
    pub backends: BackendSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dpi: 300,
            max_upload_bytes: 10 * 1024 * 1024,
            poll_interval_ms: 250,
            grace_period_ms: 5_000,
            artifact_wait_ms: 10_000,
            reader_drain_ms: 2_000,
            worker_program: None,
            backends: BackendSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from disk, falling back to defaults when absent or invalid.
    pub fn load(path: &Path) -> Self {
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Invalid settings file, using defaults");
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read settings, using defaults");
                Self::default()
            }
        }
    }

    /// Persist settings as pretty JSON.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Timeout policy for the supervisor.
    pub fn policy(&self) -> SupervisorPolicy {
        SupervisorPolicy {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            grace_period: Duration::from_millis(self.grace_period_ms),
            artifact_wait: Duration::from_millis(self.artifact_wait_ms),
            reader_drain: Duration::from_millis(self.reader_drain_ms),
        }
    }
}
