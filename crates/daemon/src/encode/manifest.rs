//! Temporary concat-demuxer manifest.

use super::EncodeError;
use crate::scan::ensure_safe_path;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// A concat manifest on disk. The file is removed when this value is dropped.
#[derive(Debug)]
pub struct ConcatManifest {
    file: NamedTempFile,
}

impl ConcatManifest {
    /// Writes a manifest listing `segments` in order.
    ///
    /// Fails with [`EncodeError::UnsafePath`] before touching the filesystem
    /// if any segment path contains shell metacharacters.
    pub fn create(segments: &[PathBuf]) -> Result<Self, EncodeError> {
        for segment in segments {
            ensure_safe_path(segment).map_err(|e| EncodeError::UnsafePath(e.to_string()))?;
        }

        let mut file = tempfile::Builder::new()
            .prefix("vts-concat-")
            .suffix(".txt")
            .tempfile()?;
        file.write_all(render_manifest(segments).as_bytes())?;
        file.flush()?;

        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Renders `file '<path>'` lines, escaping embedded single quotes.
pub fn render_manifest(segments: &[PathBuf]) -> String {
    segments
        .iter()
        .map(|p| {
            let escaped = p.to_string_lossy().replace('\'', r"'\''");
            format!("file '{}'\n", escaped)
        })
        .collect()
}
