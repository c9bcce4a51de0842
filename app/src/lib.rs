pub mod cli;
pub mod commands;
pub mod error;

use std::sync::Arc;

use drawscan_core::jobs::WorkerLauncher;
use drawscan_core::{Config, ProcessLauncher, Settings, Supervisor};

/// Initialize tracing/logging with the given directives
///
/// Output goes to stderr; a worker's stdout carries only protocol lines.
pub fn init_logging(directives: &[&str]) {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in directives {
        match directive.parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Ignoring invalid log directive {:?}: {}", directive, e),
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Shared state behind every command
pub struct AppState {
    pub config: Config,
    pub settings: Settings,
    pub supervisor: Arc<Supervisor>,
}

impl AppState {
    pub fn new(config: Config, settings: Settings, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let supervisor = Arc::new(Supervisor::new(&config, &settings, launcher));
        Self {
            config,
            settings,
            supervisor,
        }
    }

    /// Create data directories, load settings and supervise workers running
    /// as child processes of `worker_program` (this executable by default).
    pub fn open(config: Config) -> anyhow::Result<Self> {
        config.ensure_dirs()?;
        let settings = Settings::load(&config.settings_file);
        let program = match &settings.worker_program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };
        tracing::info!(
            data_dir = %config.data_dir.display(),
            worker = %program.display(),
            "Opened data directory"
        );
        let launcher = Arc::new(ProcessLauncher::new(program, &config.jobs_dir));
        Ok(Self::new(config, settings, launcher))
    }
}
