//! Encoder interface and the ffmpeg implementation.
//!
//! The orchestrator never talks to ffmpeg directly: it hands an
//! [`EncodeRequest`] to an [`Encoder`] and consumes the resulting stream of
//! [`EncoderEvent`]s.

pub mod ffmpeg;
pub mod manifest;

pub use ffmpeg::{build_ffmpeg_command, FfmpegEncoder, ProgressParser};
pub use manifest::ConcatManifest;

use crate::probe::{MediaInfo, ProbeError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vts_batch_config::EncoderConfig;

/// x264 preset names accepted in [`EncodeParams::preset`].
pub const X264_PRESETS: &[&str] = &[
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
    "placebo",
];

/// Highest CRF value libx264 accepts for 8-bit output.
pub const MAX_CRF: u8 = 51;

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Encoder parameters rejected before anything was spawned
    #[error("Invalid encoder parameters: {0}")]
    InvalidParams(String),

    /// A path that would be handed to the encoder contains shell metacharacters
    #[error("Unsafe path: {0}")]
    UnsafePath(String),

    /// IO error while preparing or spawning the encoder
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Quality parameters passed through to the encoder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodeParams {
    /// x264 preset (speed/size trade-off)
    pub preset: String,
    /// Constant rate factor
    pub crf: u8,
    /// AAC bitrate, e.g. "192k"
    pub audio_bitrate: String,
}

impl EncodeParams {
    /// Checks the parameters against what libx264/aac accept.
    pub fn validate(&self) -> Result<(), EncodeError> {
        if !X264_PRESETS.contains(&self.preset.as_str()) {
            return Err(EncodeError::InvalidParams(format!(
                "unknown preset '{}'",
                self.preset
            )));
        }
        if self.crf > MAX_CRF {
            return Err(EncodeError::InvalidParams(format!(
                "crf {} out of range 0-{}",
                self.crf, MAX_CRF
            )));
        }
        let digits = self.audio_bitrate.strip_suffix('k').unwrap_or("");
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(EncodeError::InvalidParams(format!(
                "audio bitrate '{}' must look like 192k",
                self.audio_bitrate
            )));
        }
        Ok(())
    }
}

impl Default for EncodeParams {
    fn default() -> Self {
        Self::from(&EncoderConfig::default())
    }
}

impl From<&EncoderConfig> for EncodeParams {
    fn from(cfg: &EncoderConfig) -> Self {
        Self {
            preset: cfg.preset.clone(),
            crf: cfg.crf,
            audio_bitrate: cfg.audio_bitrate.clone(),
        }
    }
}

/// One encoder invocation: all segments of a group into one output file.
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    /// Concat manifest listing `segments`, owned by the caller
    pub manifest: PathBuf,
    /// Ordered input segments
    pub segments: Vec<PathBuf>,
    /// Output artifact path
    pub output: PathBuf,
    /// Quality parameters
    pub params: EncodeParams,
    /// Encoder thread count (0 lets the encoder decide)
    pub threads: u32,
}

/// A progress sample reported by the encoder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressReport {
    /// Encoder's own completion percentage, if it computes one
    pub percent: Option<f64>,
    /// Output timestamp reached so far, in seconds
    pub position_secs: Option<f64>,
    /// Current encoding speed in frames per second
    pub fps: Option<f64>,
    /// Current output bitrate in kbit/s
    pub bitrate_kbps: Option<f64>,
}

/// Events emitted by a running encode.
///
/// The stream always ends with exactly one of `Done`, `Failed` or `Cancelled`.
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderEvent {
    Progress(ProgressReport),
    Done,
    Failed(String),
    Cancelled,
}

/// An external encoder the task executor can drive.
pub trait Encoder: Send + Sync {
    /// Reads container metadata for a media file. Blocking.
    fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError>;

    /// Starts encoding `request` and returns its event stream.
    ///
    /// Cancelling `cancel` asks the encoder to stop; the stream then ends with
    /// [`EncoderEvent::Cancelled`]. Must be called from within a tokio runtime.
    fn run(
        &self,
        request: EncodeRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<EncoderEvent>, EncodeError>;
}

/// File name of the output artifact for a group id.
pub fn output_file_name(group_id: &str) -> String {
    format!("video_{}.mp4", group_id)
}

/// Parses a group id back out of an output file name.
pub fn parse_output_file_name(name: &str) -> Option<&str> {
    let id = name.strip_prefix("video_")?.strip_suffix(".mp4")?;
    if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
        Some(id)
    } else {
        None
    }
}
