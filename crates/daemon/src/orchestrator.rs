//! Job orchestrator for the VTS batch daemon
//!
//! Owns the single live [`Job`], runs its tasks one after another on a
//! background task, and handles stop, resume and history bookkeeping.
//!
//! State machine: `idle -> running -> {completed, stopped}`. Only one job runs
//! at a time; `start` and `resume` race through a [`StartGuard`] and then
//! check that no run loop is alive.

use crate::concurrency::{derive_plan, StartGuard};
use crate::config::Config;
use crate::encode::{output_file_name, parse_output_file_name, Encoder};
use crate::events::{EventBus, JobEvent};
use crate::format::{format_bytes, format_duration};
use crate::history::{HistoryEntry, HistoryError, HistoryStats, HistoryStore};
use crate::job::{current_timestamp_ms, Job, JobRequest, JobStatus, LogLevel, TaskStatus};
use crate::probe::{estimate_duration, MediaInfo};
use crate::scan::{ensure_safe_path, scan_segments, select_groups, Group, ScanError};
use crate::state::{prepare_resume, ResumeStats, StateError, StateStore};
use crate::task_executor::{TaskError, TaskExecutor, TaskInput};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Error type for orchestrator calls
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Bad parameters or unsafe paths; nothing was changed
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Source missing or output directory unusable; nothing was changed
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("a conversion is already running")]
    AlreadyRunning,

    #[error("no resumable conversion")]
    NoResumableState,

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<ScanError> for OrchestratorError {
    fn from(e: ScanError) -> Self {
        match e {
            ScanError::UnsafePath(_) => OrchestratorError::InvalidInput(e.to_string()),
            ScanError::NotADirectory(_) | ScanError::Walk(_) => {
                OrchestratorError::InvalidPath(e.to_string())
            }
        }
    }
}

/// Result of a status query.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusReport {
    /// No job has run since startup.
    Idle,
    /// The live job, or the most recent one once it has finished.
    Job(Box<Job>),
}

impl Serialize for StatusReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            StatusReport::Idle => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("status", "idle")?;
                map.end()
            }
            StatusReport::Job(job) => job.serialize(serializer),
        }
    }
}

/// What a resume would pick up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResumeStateReport {
    pub present: bool,
    /// The snapshot reconciled against the output directory.
    pub job: Option<Job>,
    pub stats: Option<ResumeStats>,
    pub saved_at: Option<i64>,
}

/// One output artifact found by [`Orchestrator::analyze`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputFile {
    pub group_id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub duration_secs: Option<f64>,
    pub bitrate_mbps: Option<f64>,
    /// Probe failure, if any.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputAnalysis {
    pub files: Vec<OutputFile>,
    pub total_size_bytes: u64,
    pub total_duration_secs: f64,
}

/// Tunables for an [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub state_file: PathBuf,
    pub history_file: PathBuf,
    pub max_history_entries: usize,
    pub max_log_entries: usize,
    pub encoder_threads: u32,
    pub progress_interval: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            state_file: cfg.storage.state_file.clone(),
            history_file: cfg.storage.history_file.clone(),
            max_history_entries: cfg.storage.max_history_entries,
            max_log_entries: cfg.storage.max_log_entries,
            encoder_threads: derive_plan(cfg).encoder_threads,
            progress_interval: Duration::from_millis(cfg.encoder.progress_interval_ms),
        }
    }
}

#[derive(Default)]
struct JobSlot {
    job: Option<Job>,
    /// A run loop is alive for `job`.
    live: bool,
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    executor: TaskExecutor,
    state: StateStore,
    history: HistoryStore,
    events: EventBus,
    guard: StartGuard,
    log_capacity: usize,
    slot: Mutex<JobSlot>,
}

/// Handle to the orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(encoder: Arc<dyn Encoder>, settings: OrchestratorSettings) -> Self {
        let inner = Inner {
            executor: TaskExecutor::new(
                encoder,
                settings.encoder_threads,
                settings.progress_interval,
            ),
            state: StateStore::new(settings.state_file),
            history: HistoryStore::new(settings.history_file, settings.max_history_entries),
            events: EventBus::new(),
            guard: StartGuard::new(),
            log_capacity: settings.max_log_entries,
            slot: Mutex::new(JobSlot::default()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Lists the groups in `source_path` with their estimated durations.
    pub async fn scan(&self, source_path: &Path) -> Result<Vec<Group>, OrchestratorError> {
        ensure_safe_path(source_path)?;
        let source_path = canonical_dir(source_path, "source directory")?;
        let mut groups = scan_segments(&source_path)?;

        for group in groups.iter_mut() {
            let encoder = self.inner.executor.encoder().clone();
            let files = group.files.clone();
            let duration =
                tokio::task::spawn_blocking(move || estimate_duration(encoder.as_ref(), &files))
                    .await
                    .unwrap_or_else(|e| {
                        warn!(group = %group.id, error = %e, "duration estimate task failed");
                        0.0
                    });
            group.duration_secs = Some(duration);
        }

        Ok(groups)
    }

    /// Starts converting the requested groups.
    ///
    /// Returns the initialized job as soon as its run loop is spawned. Must be
    /// called from within a tokio runtime.
    pub fn start(&self, mut request: JobRequest) -> Result<Job, OrchestratorError> {
        validate_request(&request)?;

        let _permit = self
            .inner
            .guard
            .try_acquire()
            .ok_or(OrchestratorError::AlreadyRunning)?;
        if self.inner.slot().live {
            return Err(OrchestratorError::AlreadyRunning);
        }

        request.source_path = canonical_dir(&request.source_path, "source directory")?;
        let groups = select_groups(
            scan_segments(&request.source_path)?,
            &request.selected_groups,
        );
        if groups.is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "no matching VOB segments in source directory".to_string(),
            ));
        }
        fs::create_dir_all(&request.output_path).map_err(|e| {
            OrchestratorError::InvalidPath(format!(
                "cannot create output directory {}: {}",
                request.output_path.display(),
                e
            ))
        })?;
        request.output_path = canonical_dir(&request.output_path, "output directory")?;

        let ids: Vec<String> = groups.iter().map(|g| g.id.clone()).collect();
        let mut job = Job::new(request, &ids);
        job.set_log_capacity(self.inner.log_capacity);
        job.log(
            LogLevel::Info,
            format!("Starting conversion of {} groups: {}", ids.len(), ids.join(", ")),
        );
        info!(job_id = %job.id, groups = ?ids, "starting conversion");

        Ok(self.launch(job, groups))
    }

    /// Stops the running job. Does nothing if no job is running.
    ///
    /// The in-flight encoder is asked to quit and killed after its grace
    /// period; the run loop winds down in the background.
    pub fn stop(&self) {
        let now = current_timestamp_ms();
        let (resumable, summary) = {
            let mut slot = self.inner.slot();
            if !slot.live {
                return;
            }
            let Some(job) = slot.job.as_mut().filter(|j| j.is_running()) else {
                return;
            };

            let resumable = job.clone();
            job.stop(now);
            job.log(LogLevel::Warn, "Conversion stopped by user");
            let summary = job.summary();

            if let Some(cancel) = &slot.cancel {
                cancel.cancel();
            }
            (resumable, summary)
        };

        warn!(job_id = %summary.id, "conversion stopped by user");
        if let Err(e) = self.inner.state.save(&resumable) {
            warn!(error = %e, "failed to snapshot stopped job");
        }
        self.inner.events.publish(JobEvent::Stopped { summary });
    }

    /// Current or most recent job.
    pub fn status(&self) -> StatusReport {
        match &self.inner.slot().job {
            Some(job) => StatusReport::Job(Box::new(job.clone())),
            None => StatusReport::Idle,
        }
    }

    /// Describes the resumable snapshot, if any, without resuming it.
    pub fn resume_state(&self) -> ResumeStateReport {
        match self.inner.state.load() {
            Some(state) => {
                let saved_at = state.saved_at;
                let job = prepare_resume(state, current_timestamp_ms());
                ResumeStateReport {
                    present: true,
                    stats: Some(ResumeStats::of(&job)),
                    job: Some(job),
                    saved_at: Some(saved_at),
                }
            }
            None => ResumeStateReport {
                present: false,
                job: None,
                stats: None,
                saved_at: None,
            },
        }
    }

    /// Resumes the persisted job, skipping groups already converted.
    pub fn resume(&self) -> Result<Job, OrchestratorError> {
        let _permit = self
            .inner
            .guard
            .try_acquire()
            .ok_or(OrchestratorError::AlreadyRunning)?;
        if self.inner.slot().live {
            return Err(OrchestratorError::AlreadyRunning);
        }

        let state = self
            .inner
            .state
            .load()
            .ok_or(OrchestratorError::NoResumableState)?;
        let mut job = prepare_resume(state, current_timestamp_ms());
        job.set_log_capacity(self.inner.log_capacity);

        job.source_path = canonical_dir(&job.source_path, "source directory")?;
        let groups = scan_segments(&job.source_path)?;
        self.inner.state.clear()?;

        let stats = ResumeStats::of(&job);
        info!(
            job_id = %job.id,
            completed = stats.completed,
            remaining = stats.remaining,
            "resuming conversion"
        );

        Ok(self.launch(job, groups))
    }

    pub fn clear_resume_state(&self) -> Result<(), OrchestratorError> {
        self.inner.state.clear()?;
        Ok(())
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.history.load()
    }

    pub fn history_stats(&self) -> HistoryStats {
        self.inner.history.stats()
    }

    pub fn clear_history(&self) -> Result<(), OrchestratorError> {
        self.inner.history.clear()?;
        Ok(())
    }

    /// Lists `video_NN.mp4` outputs in `output_dir` with probed metadata.
    pub async fn analyze(&self, output_dir: &Path) -> Result<OutputAnalysis, OrchestratorError> {
        ensure_safe_path(output_dir)?;
        let entries = fs::read_dir(output_dir).map_err(|e| {
            OrchestratorError::InvalidPath(format!("{}: {}", output_dir.display(), e))
        })?;

        let mut outputs: Vec<(String, PathBuf)> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().to_str()?.to_string();
                let id = parse_output_file_name(&name)?.to_string();
                Some((id, entry.path()))
            })
            .collect();
        outputs.sort();

        let mut files = Vec::with_capacity(outputs.len());
        for (group_id, path) in outputs {
            let size_bytes = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let file = match self.probe(path.clone()).await {
                Ok(probed) => OutputFile {
                    group_id,
                    path,
                    size_bytes,
                    duration_secs: Some(probed.duration_secs),
                    bitrate_mbps: MediaInfo { size_bytes, ..probed }.bitrate_mbps(),
                    error: None,
                },
                Err(message) => OutputFile {
                    group_id,
                    path,
                    size_bytes,
                    duration_secs: None,
                    bitrate_mbps: None,
                    error: Some(message),
                },
            };
            files.push(file);
        }

        Ok(OutputAnalysis {
            total_size_bytes: files.iter().map(|f| f.size_bytes).sum(),
            total_duration_secs: files.iter().filter_map(|f| f.duration_secs).sum(),
            files,
        })
    }

    /// Waits for the current run loop, if any, to exit.
    pub async fn wait(&self) {
        let handle = self.inner.slot().handle.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "run loop panicked");
            }
        }
    }

    async fn probe(&self, path: PathBuf) -> Result<MediaInfo, String> {
        let encoder = self.inner.executor.encoder().clone();
        tokio::task::spawn_blocking(move || encoder.probe(&path))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())
    }

    /// Installs `job` as the live job and spawns its run loop.
    fn launch(&self, job: Job, groups: Vec<Group>) -> Job {
        let cancel = CancellationToken::new();
        let groups: HashMap<String, Group> =
            groups.into_iter().map(|g| (g.id.clone(), g)).collect();

        let mut slot = self.inner.slot();
        slot.job = Some(job.clone());
        slot.live = true;
        slot.cancel = Some(cancel.clone());

        let inner = self.inner.clone();
        slot.handle = Some(tokio::spawn(run_loop(inner, groups, cancel)));
        job
    }
}

fn validate_request(request: &JobRequest) -> Result<(), OrchestratorError> {
    request
        .params
        .validate()
        .map_err(|e| OrchestratorError::InvalidInput(e.to_string()))?;
    ensure_safe_path(&request.source_path)?;
    ensure_safe_path(&request.output_path)?;

    let is_group_id = |id: &str| id.len() == 2 && id.bytes().all(|b| b.is_ascii_digit());
    if let Some(bad) = request.selected_groups.iter().find(|id| !is_group_id(id)) {
        return Err(OrchestratorError::InvalidInput(format!(
            "invalid group id '{}'",
            bad
        )));
    }
    Ok(())
}

/// Resolves `path` to an absolute directory path without symlinks.
///
/// The concat demuxer resolves relative manifest entries against the
/// manifest's own directory.
fn canonical_dir(path: &Path, what: &str) -> Result<PathBuf, OrchestratorError> {
    let resolved = fs::canonicalize(path).map_err(|e| {
        OrchestratorError::InvalidPath(format!("{} {}: {}", what, path.display(), e))
    })?;
    if !resolved.is_dir() {
        return Err(OrchestratorError::InvalidPath(format!(
            "{} is not a directory: {}",
            what,
            resolved.display()
        )));
    }
    ensure_safe_path(&resolved)?;
    Ok(resolved)
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, JobSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` on the live job while it is running.
    fn with_running_job<R>(&self, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        let mut slot = self.slot();
        slot.job.as_mut().filter(|j| j.is_running()).map(f)
    }

    fn snapshot(&self, job: &Job) {
        if let Err(e) = self.state.save(job) {
            warn!(error = %e, "failed to save resume state");
        }
    }

    fn publish_task(&self, job: &Job, group_id: &str) {
        if let Some(task) = job.task(group_id) {
            self.events.publish(JobEvent::Progress {
                job_id: job.id.clone(),
                group_id: group_id.to_string(),
                status: task.status,
                progress: task.progress,
                message: task.message.clone(),
            });
        }
    }

    /// Progress sink for the running task.
    ///
    /// Snapshots the job whenever progress enters a new tens bracket. The
    /// final 100 is left to the run loop, which sets it once the output has
    /// been verified.
    fn on_progress(&self, group_id: &str, percent: u8) {
        if percent >= 100 {
            return;
        }
        let update = self.with_running_job(|job| {
            let task = job.task_mut(group_id)?;
            let before = task.progress;
            if !task.advance(percent) {
                return None;
            }
            let crossed = percent / 10 > before / 10;
            Some((job.clone(), crossed))
        });

        if let Some(Some((job, crossed))) = update {
            self.publish_task(&job, group_id);
            if crossed {
                self.snapshot(&job);
            }
        }
    }

    /// Records a task failure and notifies observers.
    fn fail_task(&self, group_id: &str, reason: &str) {
        let job = self.with_running_job(|job| {
            let task = job.task_mut(group_id).filter(|t| !t.is_terminal())?;
            task.fail(reason);
            let label = task.label();
            job.log(LogLevel::Error, format!("{}: {}", label, reason));
            Some(job.clone())
        });

        if let Some(Some(job)) = job {
            error!(job_id = %job.id, group = group_id, reason, "task failed");
            self.snapshot(&job);
            self.publish_task(&job, group_id);
            self.events.publish(JobEvent::Error {
                job_id: job.id.clone(),
                group_id: group_id.to_string(),
                message: reason.to_string(),
            });
        }
    }

    /// Ends the run: completes the job unless it was stopped, records history.
    fn finish(&self) {
        let now = current_timestamp_ms();
        let job = {
            let mut slot = self.slot();
            slot.live = false;
            slot.cancel = None;
            slot.job.as_mut().map(|job| {
                if job.is_running() {
                    job.complete(now);
                    let outcome = job.outcome();
                    job.log(
                        LogLevel::Info,
                        format!(
                            "Conversion finished ({}): {} succeeded, {} failed",
                            outcome,
                            job.count(TaskStatus::Success),
                            job.count(TaskStatus::Error)
                        ),
                    );
                }
                job.clone()
            })
        };

        let Some(job) = job else {
            return;
        };

        if job.status == JobStatus::Completed {
            info!(job_id = %job.id, outcome = %job.outcome(), "conversion completed");
            if let Err(e) = self.state.clear() {
                warn!(error = %e, "failed to clear resume state");
            }
            self.events.publish(JobEvent::Complete {
                summary: job.summary(),
            });
        }

        if let Err(e) = self.history.append(HistoryEntry::from_job(&job, now)) {
            warn!(error = %e, "failed to record conversion history");
        }
    }
}

/// Visits every pending task in group order until done or cancelled.
async fn run_loop(inner: Arc<Inner>, groups: HashMap<String, Group>, cancel: CancellationToken) {
    let pending: Vec<String> = inner
        .with_running_job(|job| {
            job.tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Pending)
                .map(|t| t.group_id.clone())
                .collect()
        })
        .unwrap_or_default();

    for group_id in pending {
        if cancel.is_cancelled() {
            break;
        }

        let started = inner.with_running_job(|job| {
            let task = job.task_mut(&group_id)?;
            task.start(current_timestamp_ms());
            let label = task.label();
            job.log(LogLevel::Info, format!("{} converting", label));
            Some(job.clone())
        });
        let job = match started {
            Some(Some(job)) => job,
            Some(None) => continue,
            None => break,
        };
        inner.publish_task(&job, &group_id);

        let Some(group) = groups.get(&group_id) else {
            inner.fail_task(&group_id, "no segments found in source directory");
            continue;
        };

        let expected_secs = match group.duration_secs {
            Some(secs) => secs,
            None => {
                let encoder = inner.executor.encoder().clone();
                let files = group.files.clone();
                tokio::task::spawn_blocking(move || estimate_duration(encoder.as_ref(), &files))
                    .await
                    .unwrap_or(0.0)
            }
        };
        debug!(group = %group_id, expected_secs, "duration estimated");

        let output = job.output_path.join(output_file_name(&group_id));
        let input = TaskInput {
            segments: group.files.clone(),
            output: output.clone(),
            params: job.params.clone(),
            expected_secs,
        };

        let result = inner
            .executor
            .execute(input, cancel.clone(), |percent| inner.on_progress(&group_id, percent))
            .await
            .and_then(|()| {
                if output.is_file() {
                    Ok(())
                } else {
                    Err(TaskError::OutputMissing(output.clone()))
                }
            });

        match result {
            Ok(()) => {
                let encoder = inner.executor.encoder().clone();
                let probe_path = output.clone();
                let probed = tokio::task::spawn_blocking(move || encoder.probe(&probe_path))
                    .await
                    .ok()
                    .and_then(Result::ok);
                let size = fs::metadata(&output).map(|m| m.len()).unwrap_or(0);
                let duration = probed.as_ref().map(|i| i.duration_secs).unwrap_or(0.0);
                let measured = MediaInfo {
                    duration_secs: duration,
                    size_bytes: size,
                    bit_rate_bps: None,
                };

                let finished = inner.with_running_job(|job| {
                    let task = job.task_mut(&group_id).filter(|t| !t.is_terminal())?;
                    task.succeed(duration, size);
                    let line = format!(
                        "{}: {}, {}, {:.2} Mbps",
                        task.label(),
                        format_duration(duration),
                        format_bytes(size),
                        measured.bitrate_mbps().unwrap_or(0.0)
                    );
                    job.log(LogLevel::Ok, line.clone());
                    Some((job.clone(), line))
                });

                match finished {
                    Some(Some((job, line))) => {
                        info!(job_id = %job.id, "{}", line);
                        inner.snapshot(&job);
                        inner.publish_task(&job, &group_id);
                    }
                    // Stopped while the encoder was finishing; the output is complete
                    _ => break,
                }
            }
            Err(TaskError::Cancelled) => {
                remove_partial_output(&output);
                break;
            }
            Err(e) => {
                let still_running = inner.with_running_job(|_| ()).is_some();
                if !still_running || cancel.is_cancelled() {
                    remove_partial_output(&output);
                    break;
                }
                inner.fail_task(&group_id, &e.to_string());
            }
        }
    }

    inner.finish();
}

fn remove_partial_output(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "removed partial output"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial output"),
    }
}
