//! Scripted encoder used by unit tests in place of ffmpeg/ffprobe.

use crate::encode::{EncodeError, EncodeRequest, Encoder, EncoderEvent, ProgressReport};
use crate::probe::{MediaInfo, ProbeError};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
enum Ending {
    Succeed { output_bytes: u64 },
    SucceedWithoutOutput,
    Fail(String),
    Hang { partial_bytes: Option<u64> },
}

/// What the fake encoder does for one output file.
#[derive(Debug, Clone)]
pub struct Script {
    progress: Vec<ProgressReport>,
    ending: Ending,
}

impl Script {
    /// Emit `progress`, write an output of `output_bytes`, report done.
    pub fn succeed(progress: Vec<ProgressReport>, output_bytes: u64) -> Self {
        Self {
            progress,
            ending: Ending::Succeed { output_bytes },
        }
    }

    /// Report done without writing anything.
    pub fn succeed_without_output() -> Self {
        Self {
            progress: vec![],
            ending: Ending::SucceedWithoutOutput,
        }
    }

    pub fn fail(progress: Vec<ProgressReport>, message: &str) -> Self {
        Self {
            progress,
            ending: Ending::Fail(message.to_string()),
        }
    }

    /// Block until cancelled.
    pub fn hang() -> Self {
        Self {
            progress: vec![],
            ending: Ending::Hang { partial_bytes: None },
        }
    }

    /// Emit `progress`, then block until cancelled.
    pub fn progress_then_hang(progress: Vec<ProgressReport>) -> Self {
        Self {
            progress,
            ending: Ending::Hang { partial_bytes: None },
        }
    }

    /// Write a partial output, then block until cancelled.
    pub fn hang_with_partial_output(bytes: u64) -> Self {
        Self {
            progress: vec![],
            ending: Ending::Hang {
                partial_bytes: Some(bytes),
            },
        }
    }
}

/// A request as seen by the fake, plus the manifest text at spawn time.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub request: EncodeRequest,
    pub manifest_contents: Option<String>,
}

impl std::ops::Deref for RecordedRequest {
    type Target = EncodeRequest;

    fn deref(&self) -> &EncodeRequest {
        &self.request
    }
}

/// Fake [`Encoder`] keyed by file name.
///
/// Probes answer from configured segment durations or from files on disk;
/// runs follow the [`Script`] registered for the output file name and
/// succeed with a 2 MiB output otherwise.
#[derive(Debug, Default)]
pub struct ScriptedEncoder {
    durations: HashMap<String, f64>,
    scripts: HashMap<String, Script>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_duration(mut self, file_name: &str, secs: f64) -> Self {
        self.durations.insert(file_name.to_string(), secs);
        self
    }

    pub fn with_script(mut self, output_name: &str, script: Script) -> Self {
        self.scripts.insert(output_name.to_string(), script);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

impl Encoder for ScriptedEncoder {
    fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError> {
        let name = file_name(path);
        let on_disk = fs::metadata(path).ok().map(|m| m.len());

        match (self.durations.get(&name), on_disk) {
            (Some(secs), size) => Ok(MediaInfo {
                duration_secs: *secs,
                size_bytes: size.unwrap_or(0),
                bit_rate_bps: None,
            }),
            (None, Some(size)) => Ok(MediaInfo {
                duration_secs: 60.0,
                size_bytes: size,
                bit_rate_bps: None,
            }),
            (None, None) => Err(ProbeError::FfprobeFailed(format!("{}: no such file", name))),
        }
    }

    fn run(
        &self,
        request: EncodeRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<EncoderEvent>, EncodeError> {
        let script = self
            .scripts
            .get(&file_name(&request.output))
            .cloned()
            .unwrap_or_else(|| Script::succeed(vec![], 2 << 20));

        self.requests.lock().unwrap().push(RecordedRequest {
            manifest_contents: fs::read_to_string(&request.manifest).ok(),
            request: request.clone(),
        });

        let (tx, rx) = mpsc::channel(16);
        let output = request.output;
        tokio::spawn(async move {
            for report in script.progress {
                if cancel.is_cancelled() {
                    let _ = tx.send(EncoderEvent::Cancelled).await;
                    return;
                }
                let _ = tx.send(EncoderEvent::Progress(report)).await;
            }

            let event = match script.ending {
                Ending::Succeed { output_bytes } => {
                    let file = File::create(&output).unwrap();
                    file.set_len(output_bytes).unwrap();
                    EncoderEvent::Done
                }
                Ending::SucceedWithoutOutput => EncoderEvent::Done,
                Ending::Fail(message) => EncoderEvent::Failed(message),
                Ending::Hang { partial_bytes } => {
                    if let Some(bytes) = partial_bytes {
                        File::create(&output).unwrap().set_len(bytes).unwrap();
                    }
                    cancel.cancelled().await;
                    EncoderEvent::Cancelled
                }
            };
            let _ = tx.send(event).await;
        });

        Ok(rx)
    }
}
