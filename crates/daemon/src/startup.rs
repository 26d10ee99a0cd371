//! Startup checks for the VTS batch daemon
//!
//! Verifies that the external tools the encoder adapter shells out to are
//! installed before the daemon accepts work:
//! - `ffmpeg -version`
//! - `ffprobe -version`

use crate::config::Config;
use serde::{Deserialize, Serialize};
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },
}

/// Availability of one external tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolStatus {
    /// Command that was run
    pub path: String,
    pub available: bool,
    /// Version string from the first output line, e.g. "6.1.1" or "n7.0-12-gabc"
    pub version: Option<String>,
    pub error: Option<String>,
}

/// Result of [`check_dependencies`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyReport {
    pub ffmpeg: ToolStatus,
    pub ffprobe: ToolStatus,
}

impl DependencyReport {
    pub fn all_available(&self) -> bool {
        self.ffmpeg.available && self.ffprobe.available
    }

    /// Fails with the first missing tool.
    pub fn require_all(&self) -> Result<(), StartupError> {
        for (tool, status) in [("ffmpeg", &self.ffmpeg), ("ffprobe", &self.ffprobe)] {
            if !status.available {
                return Err(StartupError::ToolUnavailable {
                    tool: tool.to_string(),
                    reason: status
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("'{} -version' failed", status.path)),
                });
            }
        }
        Ok(())
    }
}

/// Extracts the version token following `<tool> version` in `-version` output.
///
/// Handles both release strings ("ffmpeg version 6.1.1-3ubuntu5 ...") and
/// git builds ("ffprobe version n7.0-12-gabcdef ...").
pub fn parse_tool_version(tool: &str, output: &str) -> Option<String> {
    let marker = format!("{} version", tool);
    let line = output
        .lines()
        .find(|line| line.to_lowercase().contains(&marker))?;

    let start = line.to_lowercase().find(&marker)? + marker.len();
    line.get(start..)?
        .split_whitespace()
        .next()
        .map(str::to_string)
}

/// Runs `<path> -version` and reports what it found.
pub fn check_tool(tool: &str, path: &str) -> ToolStatus {
    let output = match Command::new(path).arg("-version").output() {
        Ok(output) => output,
        Err(e) => {
            return ToolStatus {
                path: path.to_string(),
                available: false,
                version: None,
                error: Some(format!("failed to run '{} -version': {}", path, e)),
            };
        }
    };

    if !output.status.success() {
        return ToolStatus {
            path: path.to_string(),
            available: false,
            version: None,
            error: Some(format!("'{} -version' exited with {}", path, output.status)),
        };
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    ToolStatus {
        path: path.to_string(),
        available: true,
        version: parse_tool_version(tool, &stdout),
        error: None,
    }
}

/// Checks ffmpeg and ffprobe as configured.
pub fn check_dependencies(cfg: &Config) -> DependencyReport {
    let report = DependencyReport {
        ffmpeg: check_tool("ffmpeg", &cfg.encoder.ffmpeg_path),
        ffprobe: check_tool("ffprobe", &cfg.encoder.ffprobe_path),
    };

    for (tool, status) in [("ffmpeg", &report.ffmpeg), ("ffprobe", &report.ffprobe)] {
        match (&status.version, &status.error) {
            (_, Some(error)) => warn!(tool, %error, "dependency check failed"),
            (Some(version), None) => info!(tool, %version, "dependency found"),
            (None, None) => info!(tool, "dependency found, version unknown"),
        }
    }

    report
}

/// Run all startup checks
pub fn run_startup_checks(cfg: &Config) -> Result<DependencyReport, StartupError> {
    let report = check_dependencies(cfg);
    report.require_all()?;
    Ok(report)
}
