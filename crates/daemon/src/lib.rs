//! VTS Batch Daemon
//!
//! Background service that groups DVD title set segments, converts each group
//! to one MP4 with ffmpeg, and keeps resume state and history across runs.

pub mod concurrency;
pub mod daemon;
pub mod encode;
pub mod events;
pub mod format;
pub mod history;
pub mod job;
pub mod orchestrator;
pub mod probe;
pub mod progress;
pub mod scan;
pub mod server;
pub mod startup;
pub mod state;
pub mod task_executor;

#[cfg(test)]
mod testing;

pub use concurrency::{derive_plan, ConcurrencyPlan, StartGuard};
pub use daemon::{Daemon, DaemonError};
pub use encode::{EncodeError, EncodeParams, Encoder, FfmpegEncoder};
pub use events::{EventBus, JobEvent};
pub use history::{HistoryEntry, HistoryStats, HistoryStore};
pub use job::{Job, JobRequest, JobStatus, Outcome, Task, TaskStatus};
pub use orchestrator::{Orchestrator, OrchestratorError, OrchestratorSettings, StatusReport};
pub use scan::{scan_segments, Group, ScanError};
pub use server::{create_router, run_server, serve, AppState, ServerError};
pub use startup::{check_dependencies, run_startup_checks, DependencyReport, StartupError};
pub use state::{PersistedState, StateStore};
pub use vts_batch_config as config;
pub use vts_batch_config::Config;
