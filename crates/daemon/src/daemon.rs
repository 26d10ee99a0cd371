//! Daemon startup and main loop for the VTS batch daemon
//!
//! Wires configuration, the ffmpeg encoder adapter, the orchestrator and the
//! HTTP API together.

use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::encode::{Encoder, FfmpegEncoder};
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::server::{run_server, AppState, ServerError};
use crate::startup::{run_startup_checks, StartupError};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived encoder threading
    pub concurrency_plan: ConcurrencyPlan,
    pub orchestrator: Orchestrator,
}

impl Daemon {
    /// Loads configuration (defaults when the file is absent), checks for
    /// ffmpeg/ffprobe and builds the orchestrator.
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load_or_default(config_path)?;
        Self::with_config(config)
    }

    /// Same as [`Daemon::new`] with an already loaded configuration.
    pub fn with_config(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Ok(Self::new_without_checks(config))
    }

    /// Builds the daemon without probing for external tools.
    pub fn new_without_checks(config: Config) -> Self {
        let encoder = Arc::new(FfmpegEncoder::from_config(&config.encoder));
        Self::with_encoder(config, encoder)
    }

    /// Builds the daemon around a given encoder.
    pub fn with_encoder(config: Config, encoder: Arc<dyn Encoder>) -> Self {
        let concurrency_plan = derive_plan(&config);
        let orchestrator = Orchestrator::new(encoder, OrchestratorSettings::from_config(&config));

        info!(
            cores = concurrency_plan.total_cores,
            encoder_threads = concurrency_plan.encoder_threads,
            state_file = %config.storage.state_file.display(),
            history_file = %config.storage.history_file.display(),
            "daemon initialized"
        );

        Self {
            config,
            concurrency_plan,
            orchestrator,
        }
    }

    fn app_state(&self) -> AppState {
        AppState::new(self.orchestrator.clone(), Arc::new(self.config.clone()))
    }

    /// Serves the HTTP API until Ctrl-C.
    ///
    /// On Ctrl-C a running job is stopped, leaving a resumable snapshot, before
    /// open connections drain. Its run loop is awaited after the server exits.
    pub async fn run_with_server(&self) -> Result<(), DaemonError> {
        if let Some(snapshot) = self.orchestrator.resume_state().stats {
            info!(
                completed = snapshot.completed,
                remaining = snapshot.remaining,
                "found resumable conversion"
            );
        }

        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
        };

        run_server(self.app_state(), &self.config.server.bind_addr, shutdown).await?;

        self.orchestrator.wait().await;
        info!("daemon stopped");
        Ok(())
    }
}
