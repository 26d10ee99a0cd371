//! Media probing and duration estimation.
//!
//! Probes files with ffprobe to collect container metadata, and sums segment
//! durations for a group so progress can be expressed as a percentage.

use crate::encode::Encoder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::warn;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Container-level metadata for one media file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaInfo {
    /// Duration in seconds (0 when unknown).
    pub duration_secs: f64,
    /// File size in bytes.
    pub size_bytes: u64,
    /// Overall bitrate in bits per second, if reported.
    pub bit_rate_bps: Option<u64>,
}

impl MediaInfo {
    /// Average bitrate in Mbps derived from size and duration.
    pub fn bitrate_mbps(&self) -> Option<f64> {
        if self.duration_secs > 0.0 {
            Some((self.size_bytes as f64 * 8.0) / self.duration_secs / 1_000_000.0)
        } else {
            None
        }
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub size: Option<String>,
        pub bit_rate: Option<String>,
    }
}

/// Probes a media file with the given ffprobe binary.
///
/// Runs `<ffprobe> -v quiet -print_format json -show_format <path>`
/// and parses the JSON output.
pub fn probe_file(ffprobe: &str, path: &Path) -> Result<MediaInfo, ProbeError> {
    let output = Command::new(ffprobe)
        .args(["-v", "quiet", "-print_format", "json", "-show_format"])
        .arg(path)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ffprobe_output(&stdout)
}

/// Parses ffprobe JSON output into a [`MediaInfo`].
pub fn parse_ffprobe_output(json_str: &str) -> Result<MediaInfo, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let duration_secs = format
        .duration
        .as_ref()
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
        .unwrap_or(0.0);

    let size_bytes = format
        .size
        .as_ref()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    let bit_rate_bps = format.bit_rate.as_ref().and_then(|b| b.parse::<u64>().ok());

    Ok(MediaInfo {
        duration_secs,
        size_bytes,
        bit_rate_bps,
    })
}

/// Sums the probed durations of `files`.
///
/// A segment that fails to probe contributes zero; the failure is logged and
/// the sum continues.
pub fn estimate_duration(encoder: &dyn Encoder, files: &[PathBuf]) -> f64 {
    files
        .iter()
        .map(|file| match encoder.probe(file) {
            Ok(info) => info.duration_secs,
            Err(e) => {
                warn!(file = %file.display(), error = %e, "segment probe failed, counting as zero");
                0.0
            }
        })
        .sum()
}
