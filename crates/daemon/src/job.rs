//! Conversion job data model.
//!
//! A [`Job`] is one run of the orchestrator over a set of title groups. It owns
//! one [`Task`] per group, a bounded log ring, and the final outcome once the
//! run loop has visited every task.

use crate::encode::EncodeParams;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Default capacity of a job's log ring.
pub const DEFAULT_LOG_CAPACITY: usize = 100;

/// Status of a single group conversion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not started yet.
    #[default]
    Pending,
    /// Encoder is running.
    Processing,
    /// Output written and verified.
    Success,
    /// Encoder failed or produced no output.
    Error,
    /// Stopped while processing.
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Processing => write!(f, "processing"),
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::Error => write!(f, "error"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Status of a whole job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Stopped,
    Completed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Stopped => write!(f, "stopped"),
            JobStatus::Completed => write!(f, "completed"),
        }
    }
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// No task failed.
    Success,
    /// Some tasks succeeded and some failed.
    Partial,
    /// No task succeeded.
    Error,
    /// Stopped by the user before the end.
    Cancelled,
}

impl Outcome {
    /// Outcome of a job that visited every task.
    pub fn from_counts(succeeded: usize, failed: usize) -> Self {
        match (succeeded, failed) {
            (_, 0) => Outcome::Success,
            (0, _) => Outcome::Error,
            _ => Outcome::Partial,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Partial => write!(f, "partial"),
            Outcome::Error => write!(f, "error"),
            Outcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Severity of a job log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Ok,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: i64,
    pub level: LogLevel,
    pub message: String,
}

/// Conversion of one group into one output file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Group identifier (e.g. "01").
    pub group_id: String,
    pub status: TaskStatus,
    /// Whole percent, 0-100.
    pub progress: u8,
    pub message: String,
    /// Unix timestamp (milliseconds) when the encoder was started.
    pub started_at: Option<i64>,
    /// Probed output duration in seconds, on success.
    pub duration_secs: Option<f64>,
    /// Output size in bytes, on success.
    pub size_bytes: Option<u64>,
}

impl Task {
    pub fn pending(group_id: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            status: TaskStatus::Pending,
            progress: 0,
            message: format!("VTS_{} waiting", group_id),
            started_at: None,
            duration_secs: None,
            size_bytes: None,
        }
    }

    pub fn label(&self) -> String {
        format!("VTS_{}", self.group_id)
    }

    /// Mark the task as processing from `now`.
    pub fn start(&mut self, now: i64) {
        self.status = TaskStatus::Processing;
        self.progress = 0;
        self.started_at = Some(now);
        self.message = format!("{} converting...", self.label());
    }

    /// Raise progress while processing; lower values are ignored.
    ///
    /// Returns true if the stored value changed.
    pub fn advance(&mut self, percent: u8) -> bool {
        if self.status != TaskStatus::Processing || percent <= self.progress {
            return false;
        }
        self.progress = percent.min(100);
        self.message = format!("{} converting... {}%", self.label(), self.progress);
        true
    }

    pub fn succeed(&mut self, duration_secs: f64, size_bytes: u64) {
        self.status = TaskStatus::Success;
        self.progress = 100;
        self.duration_secs = Some(duration_secs);
        self.size_bytes = Some(size_bytes);
        self.message = format!("{} done", self.label());
    }

    pub fn fail(&mut self, reason: &str) {
        self.status = TaskStatus::Error;
        self.message = format!("Error: {}", reason);
    }

    pub fn cancel(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.message = "Stopped by user".to_string();
    }

    /// Put the task back in the queue with `message`.
    pub fn reset(&mut self, message: &str) {
        self.status = TaskStatus::Pending;
        self.progress = 0;
        self.started_at = None;
        self.message = message.to_string();
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Success | TaskStatus::Error | TaskStatus::Cancelled
        )
    }
}

/// What the caller asks for when starting a conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Directory holding the VOB segments.
    pub source_path: PathBuf,
    /// Directory receiving `video_NN.mp4` files.
    pub output_path: PathBuf,
    #[serde(flatten)]
    pub params: EncodeParams,
    /// Group ids to convert; empty means all.
    #[serde(default)]
    pub selected_groups: Vec<String>,
}

/// Short description of a job, carried by completion and stop events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: String,
    pub status: JobStatus,
    pub final_status: Option<Outcome>,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub elapsed_secs: Option<f64>,
}

/// One conversion run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier (UUID).
    pub id: String,
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    pub params: EncodeParams,
    pub selected_groups: Vec<String>,
    /// One task per group, in group order.
    pub tasks: Vec<Task>,
    pub status: JobStatus,
    /// Unix timestamp (milliseconds) when the job started.
    pub started_at: i64,
    /// Unix timestamp (milliseconds) when the job completed or was stopped.
    pub ended_at: Option<i64>,
    /// Set only once the job has completed.
    pub elapsed_secs: Option<f64>,
    /// Set only once the job has completed.
    pub final_status: Option<Outcome>,
    /// When this run was resumed from a snapshot.
    pub resumed_at: Option<i64>,
    /// Save timestamp of the snapshot this run was resumed from.
    pub resumed_from: Option<i64>,
    /// Most recent log lines, oldest first.
    pub logs: VecDeque<LogEntry>,
    #[serde(skip, default = "default_log_capacity")]
    log_capacity: usize,
}

fn default_log_capacity() -> usize {
    DEFAULT_LOG_CAPACITY
}

impl Job {
    /// Creates a running job with one pending task per group id.
    pub fn new(request: JobRequest, group_ids: &[String]) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_path: request.source_path,
            output_path: request.output_path,
            params: request.params,
            selected_groups: request.selected_groups,
            tasks: group_ids.iter().map(|id| Task::pending(id)).collect(),
            status: JobStatus::Running,
            started_at: current_timestamp_ms(),
            ended_at: None,
            elapsed_secs: None,
            final_status: None,
            resumed_at: None,
            resumed_from: None,
            logs: VecDeque::new(),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }

    /// Changes the log ring capacity, evicting the oldest entries if needed.
    pub fn set_log_capacity(&mut self, capacity: usize) {
        self.log_capacity = capacity.max(1);
        while self.logs.len() > self.log_capacity {
            self.logs.pop_front();
        }
    }

    /// Appends a log line, evicting the oldest one when the ring is full.
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.logs.len() >= self.log_capacity {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            timestamp: current_timestamp_ms(),
            level,
            message: message.into(),
        });
    }

    pub fn task(&self, group_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.group_id == group_id)
    }

    pub fn task_mut(&mut self, group_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.group_id == group_id)
    }

    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// Sum of output sizes of successful tasks.
    pub fn total_size_bytes(&self) -> u64 {
        self.tasks.iter().filter_map(|t| t.size_bytes).sum()
    }

    /// Sum of output durations of successful tasks.
    pub fn total_duration_secs(&self) -> f64 {
        self.tasks.iter().filter_map(|t| t.duration_secs).sum()
    }

    /// Marks every processing task cancelled and the job stopped.
    pub fn stop(&mut self, now: i64) {
        for task in self.tasks.iter_mut() {
            if task.status == TaskStatus::Processing {
                task.cancel();
            }
        }
        self.status = JobStatus::Stopped;
        self.ended_at = Some(now);
    }

    /// Marks the job completed and derives its outcome.
    pub fn complete(&mut self, now: i64) {
        self.status = JobStatus::Completed;
        self.ended_at = Some(now);
        self.elapsed_secs = Some(elapsed_secs(self.started_at, now));
        self.final_status = Some(Outcome::from_counts(
            self.count(TaskStatus::Success),
            self.count(TaskStatus::Error),
        ));
    }

    /// Outcome for history: the final status, or cancelled if stopped.
    pub fn outcome(&self) -> Outcome {
        match (self.status, self.final_status) {
            (_, Some(outcome)) => outcome,
            (JobStatus::Stopped, None) => Outcome::Cancelled,
            (_, None) => Outcome::from_counts(
                self.count(TaskStatus::Success),
                self.count(TaskStatus::Error),
            ),
        }
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id.clone(),
            status: self.status,
            final_status: self.final_status,
            total: self.tasks.len(),
            completed: self.count(TaskStatus::Success),
            failed: self.count(TaskStatus::Error),
            elapsed_secs: self.elapsed_secs,
        }
    }
}

/// Seconds between two millisecond timestamps, never negative.
pub fn elapsed_secs(from_ms: i64, to_ms: i64) -> f64 {
    (to_ms - from_ms).max(0) as f64 / 1000.0
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
