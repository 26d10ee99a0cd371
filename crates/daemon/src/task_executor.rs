//! Task executor for the VTS batch daemon
//!
//! Runs one encoder invocation for one group and turns the encoder's progress
//! samples into a throttled, monotonic percentage.

use crate::encode::{
    ConcatManifest, EncodeError, EncodeParams, EncodeRequest, Encoder, EncoderEvent,
};
use crate::progress::{derive_percent, ProgressThrottle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Error type for a single task
#[derive(Debug, Error)]
pub enum TaskError {
    /// Manifest or encoder could not be set up
    #[error("{0}")]
    Setup(#[from] EncodeError),

    /// Encoder reported a failure
    #[error("{0}")]
    Encoder(String),

    /// Encoder stream ended without a final result
    #[error("encoder exited without reporting a result")]
    EncoderVanished,

    /// Encoder reported success but the output file is absent
    #[error("output file missing: {0}")]
    OutputMissing(PathBuf),

    /// Stopped before completion
    #[error("stopped by user")]
    Cancelled,
}

/// Inputs for one group conversion.
#[derive(Debug, Clone)]
pub struct TaskInput {
    /// Ordered segment files
    pub segments: Vec<PathBuf>,
    /// Output artifact path
    pub output: PathBuf,
    pub params: EncodeParams,
    /// Expected output duration in seconds (0 if unknown)
    pub expected_secs: f64,
}

/// Drives encoder invocations one task at a time.
pub struct TaskExecutor {
    encoder: Arc<dyn Encoder>,
    threads: u32,
    progress_interval: Duration,
}

impl TaskExecutor {
    pub fn new(encoder: Arc<dyn Encoder>, threads: u32, progress_interval: Duration) -> Self {
        Self {
            encoder,
            threads,
            progress_interval,
        }
    }

    pub fn encoder(&self) -> &Arc<dyn Encoder> {
        &self.encoder
    }

    /// Encodes one group.
    ///
    /// `on_progress` receives non-decreasing percentages at most once per
    /// progress interval, then exactly `100` once if the encoder reports
    /// success. The temporary concat manifest is removed before this returns,
    /// whatever the outcome.
    pub async fn execute<F>(
        &self,
        input: TaskInput,
        cancel: CancellationToken,
        mut on_progress: F,
    ) -> Result<(), TaskError>
    where
        F: FnMut(u8),
    {
        let manifest = ConcatManifest::create(&input.segments)?;

        let request = EncodeRequest {
            manifest: manifest.path().to_path_buf(),
            segments: input.segments,
            output: input.output,
            params: input.params,
            threads: self.threads,
        };

        let mut events = self.encoder.run(request, cancel.clone())?;
        let mut throttle = ProgressThrottle::new(self.progress_interval);
        let mut reported = 0u8;

        let result = loop {
            match events.recv().await {
                Some(EncoderEvent::Progress(report)) => {
                    let percent = derive_percent(&report, input.expected_secs).max(reported);
                    if throttle.ready() {
                        reported = percent;
                        on_progress(percent);
                    }
                }
                Some(EncoderEvent::Done) => {
                    on_progress(100);
                    break Ok(());
                }
                Some(EncoderEvent::Failed(message)) => break Err(TaskError::Encoder(message)),
                Some(EncoderEvent::Cancelled) => break Err(TaskError::Cancelled),
                None if cancel.is_cancelled() => break Err(TaskError::Cancelled),
                None => break Err(TaskError::EncoderVanished),
            }
        };

        debug!(manifest = %manifest.path().display(), "removing concat manifest");
        drop(manifest);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::ProgressReport;
    use crate::testing::{Script, ScriptedEncoder};
    use tempfile::TempDir;

    fn position(secs: f64) -> ProgressReport {
        ProgressReport {
            position_secs: Some(secs),
            ..Default::default()
        }
    }

    fn make_input(dir: &TempDir, expected_secs: f64) -> TaskInput {
        TaskInput {
            segments: vec![dir.path().join("VTS_01_1.VOB"), dir.path().join("VTS_01_2.VOB")],
            output: dir.path().join("video_01.mp4"),
            params: EncodeParams::default(),
            expected_secs,
        }
    }

    #[tokio::test]
    async fn test_success_reports_monotonic_then_100() {
        let temp = TempDir::new().unwrap();
        let encoder = Arc::new(ScriptedEncoder::new().with_script(
            "video_01.mp4",
            Script::succeed(
                vec![position(10.0), position(50.0), position(30.0), position(99.9)],
                2 << 20,
            ),
        ));
        let executor = TaskExecutor::new(encoder.clone(), 4, Duration::ZERO);

        let mut seen = Vec::new();
        executor
            .execute(make_input(&temp, 100.0), CancellationToken::new(), |p| seen.push(p))
            .await
            .unwrap();

        assert_eq!(seen, vec![10, 50, 50, 99, 100]);
        assert_eq!(seen.iter().filter(|p| **p == 100).count(), 1);

        let request = encoder.last_request().unwrap();
        assert_eq!(request.threads, 4);
        assert!(!request.manifest.exists(), "manifest must be removed");
        assert!(temp.path().join("video_01.mp4").exists());
    }

    #[tokio::test]
    async fn test_throttle_limits_progress_calls() {
        let temp = TempDir::new().unwrap();
        let samples = (1..=50).map(|i| position(i as f64)).collect();
        let encoder = Arc::new(
            ScriptedEncoder::new().with_script("video_01.mp4", Script::succeed(samples, 2 << 20)),
        );
        let executor = TaskExecutor::new(encoder, 0, Duration::from_secs(60));

        let mut seen = Vec::new();
        executor
            .execute(make_input(&temp, 100.0), CancellationToken::new(), |p| seen.push(p))
            .await
            .unwrap();

        // First sample passes, the rest fall inside the interval; then completion.
        assert_eq!(seen, vec![1, 100]);
    }

    #[tokio::test]
    async fn test_failure_propagates_and_removes_manifest() {
        let temp = TempDir::new().unwrap();
        let encoder = Arc::new(ScriptedEncoder::new().with_script(
            "video_01.mp4",
            Script::fail(vec![position(20.0)], "ffmpeg exited with code 1"),
        ));
        let executor = TaskExecutor::new(encoder.clone(), 0, Duration::ZERO);

        let mut seen = Vec::new();
        let err = executor
            .execute(make_input(&temp, 100.0), CancellationToken::new(), |p| seen.push(p))
            .await
            .unwrap_err();

        assert!(matches!(err, TaskError::Encoder(ref m) if m == "ffmpeg exited with code 1"));
        assert!(!seen.contains(&100));
        assert!(!encoder.last_request().unwrap().manifest.exists());
    }

    #[tokio::test]
    async fn test_cancel_ends_with_cancelled() {
        let temp = TempDir::new().unwrap();
        let encoder = Arc::new(ScriptedEncoder::new().with_script("video_01.mp4", Script::hang()));
        let executor = TaskExecutor::new(encoder.clone(), 0, Duration::ZERO);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = executor
            .execute(make_input(&temp, 0.0), cancel, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Cancelled));
        assert!(!encoder.last_request().unwrap().manifest.exists());
    }

    #[tokio::test]
    async fn test_unknown_duration_reports_zero_until_done() {
        let temp = TempDir::new().unwrap();
        let encoder = Arc::new(ScriptedEncoder::new().with_script(
            "video_01.mp4",
            Script::succeed(vec![position(10.0), position(20.0)], 2 << 20),
        ));
        let executor = TaskExecutor::new(encoder, 0, Duration::ZERO);

        let mut seen = Vec::new();
        executor
            .execute(make_input(&temp, 0.0), CancellationToken::new(), |p| seen.push(p))
            .await
            .unwrap();
        assert_eq!(seen, vec![0, 0, 100]);
    }

    #[tokio::test]
    async fn test_unsafe_segment_rejected_before_spawn() {
        let temp = TempDir::new().unwrap();
        let encoder = Arc::new(ScriptedEncoder::new());
        let executor = TaskExecutor::new(encoder.clone(), 0, Duration::ZERO);
        let mut input = make_input(&temp, 0.0);
        input.segments = vec![PathBuf::from("/dvd/$(reboot)/VTS_01_1.VOB")];

        let err = executor
            .execute(input, CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Setup(EncodeError::UnsafePath(_))));
        assert!(encoder.last_request().is_none());
    }
}
