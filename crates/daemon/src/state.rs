//! Resume state persistence.
//!
//! A running job is snapshotted to a single JSON file so an interrupted run can
//! be picked up after a restart. On resume the snapshot is reconciled against
//! the output directory: groups whose output already exists are not encoded
//! again.

use crate::encode::output_file_name;
use crate::job::{current_timestamp_ms, Job, JobStatus, LogLevel, TaskStatus};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Schema version written into every snapshot.
pub const STATE_VERSION: &str = "1.0";

/// Snapshots older than this are discarded on load (7 days).
pub const STALE_AFTER_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Outputs at or below this size are treated as truncated.
pub const MIN_OUTPUT_BYTES: u64 = 1024 * 1024;

/// Error type for state persistence
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file IO failed: {0}")]
    Io(#[from] io::Error),

    #[error("state serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Only running jobs are snapshotted
    #[error("refusing to persist a {0} job")]
    NotRunning(JobStatus),
}

/// The on-disk snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub job: Job,
    /// Unix timestamp (milliseconds) of the save.
    pub saved_at: i64,
    pub version: String,
}

/// Progress counts shown before resuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeStats {
    pub total: usize,
    pub completed: usize,
    pub remaining: usize,
}

impl ResumeStats {
    pub fn of(job: &Job) -> Self {
        let total = job.tasks.len();
        let completed = job.count(TaskStatus::Success);
        Self {
            total,
            completed,
            remaining: total - completed,
        }
    }
}

/// Reads and writes the snapshot file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrites the snapshot with `job`.
    ///
    /// The file is written next to its final location and renamed into place.
    pub fn save(&self, job: &Job) -> Result<(), StateError> {
        if job.status != JobStatus::Running {
            return Err(StateError::NotRunning(job.status));
        }

        let state = PersistedState {
            job: job.clone(),
            saved_at: current_timestamp_ms(),
            version: STATE_VERSION.to_string(),
        };
        let json = serde_json::to_string_pretty(&state)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Loads the snapshot if it is resumable.
    pub fn load(&self) -> Option<PersistedState> {
        self.load_at(current_timestamp_ms())
    }

    /// Loads the snapshot as of `now` (Unix milliseconds).
    ///
    /// Returns `None`, removing the file, when it is unreadable, older than
    /// [`STALE_AFTER_MS`], or holds a job that already finished.
    pub fn load_at(&self, now: i64) -> Option<PersistedState> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read resume state");
                return None;
            }
        };

        let state: PersistedState = match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "discarding unreadable resume state"
                );
                self.discard();
                return None;
            }
        };

        if now - state.saved_at > STALE_AFTER_MS {
            info!(saved_at = state.saved_at, "discarding resume state older than 7 days");
            self.discard();
            return None;
        }

        if matches!(state.job.status, JobStatus::Completed | JobStatus::Stopped) {
            info!(status = %state.job.status, "discarding resume state of a finished job");
            self.discard();
            return None;
        }

        Some(state)
    }

    /// Deletes the snapshot. Missing files are not an error.
    pub fn clear(&self) -> Result<(), StateError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn discard(&self) {
        if let Err(e) = self.clear() {
            warn!(path = %self.path.display(), error = %e, "failed to remove resume state");
        }
    }
}

/// Size of a group's output artifact if it looks complete.
pub fn valid_output_size(output_dir: &Path, group_id: &str) -> Option<u64> {
    let path = output_dir.join(output_file_name(group_id));
    fs::metadata(&path)
        .ok()
        .filter(|m| m.is_file() && m.len() > MIN_OUTPUT_BYTES)
        .map(|m| m.len())
}

/// Aligns task statuses with the artifacts present in `output_dir`.
///
/// - A group with a complete artifact becomes success/100%
/// - Any other task that is not pending is reset to pending/0%
///
/// Returns the number of groups found already converted.
pub fn reconcile(job: &mut Job, output_dir: &Path) -> usize {
    let mut converted = 0;

    for task in job.tasks.iter_mut() {
        match valid_output_size(output_dir, &task.group_id) {
            Some(size) => {
                task.status = TaskStatus::Success;
                task.progress = 100;
                task.size_bytes = Some(size);
                task.message = format!("{} already converted (resume)", task.label());
                converted += 1;
            }
            None if task.status != TaskStatus::Pending => {
                let message = format!("{} waiting (resume)", task.label());
                task.reset(&message);
                task.duration_secs = None;
                task.size_bytes = None;
            }
            None => {}
        }
    }

    converted
}

/// Turns a loaded snapshot into a job ready to run again.
pub fn prepare_resume(state: PersistedState, now: i64) -> Job {
    let mut job = state.job;
    let output_dir = job.output_path.clone();
    let converted = reconcile(&mut job, &output_dir);

    job.status = JobStatus::Running;
    job.ended_at = None;
    job.elapsed_secs = None;
    job.final_status = None;
    job.resumed_at = Some(now);
    job.resumed_from = Some(state.saved_at);

    let stats = ResumeStats::of(&job);
    job.log(
        LogLevel::Info,
        format!(
            "Resuming: {} of {} groups already converted, {} remaining",
            converted, stats.total, stats.remaining
        ),
    );
    job
}
