//! Segment grouper for raw disc video directories.
//!
//! A DVD `VIDEO_TS` directory stores each title set as a run of segment files
//! (`VTS_01_1.VOB`, `VTS_01_2.VOB`, ...). This module lists a source directory,
//! keeps the files matching that naming pattern, and groups them by their
//! 2-digit title set number.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Characters that are never allowed in a path handed to an external process.
pub const UNSAFE_PATH_CHARS: &[char] = &[';', '&', '|', '$', '`', '<', '>', '\n', '\r'];

/// Error type for scan operations.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The source path does not exist or is not a directory.
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    /// A path contains shell metacharacters.
    #[error("Unsafe characters in path: {0}")]
    UnsafePath(String),

    /// Directory traversal failed.
    #[error("Failed to list directory: {0}")]
    Walk(#[from] walkdir::Error),
}

/// A logical title: the ordered segment files sharing one title set number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Group {
    /// Two-digit title set identifier (e.g. "01").
    pub id: String,
    /// Absolute segment paths, sorted lexicographically.
    pub files: Vec<PathBuf>,
    /// Summed segment duration in seconds, once estimated.
    pub duration_secs: Option<f64>,
}

impl Group {
    /// Display label used in task messages and logs.
    pub fn label(&self) -> String {
        format!("VTS_{}", self.id)
    }
}

/// Returns true if the string contains any of [`UNSAFE_PATH_CHARS`].
pub fn has_unsafe_chars(s: &str) -> bool {
    s.contains(UNSAFE_PATH_CHARS)
}

/// Rejects paths that are not valid UTF-8 or contain shell metacharacters.
pub fn ensure_safe_path(path: &Path) -> Result<(), ScanError> {
    match path.to_str() {
        Some(s) if !has_unsafe_chars(s) => Ok(()),
        _ => Err(ScanError::UnsafePath(path.display().to_string())),
    }
}

/// Extracts the title set id from a segment file name.
///
/// Matches `VTS_<2 digits>_<digits>.VOB`, case-insensitively.
/// Returns `None` for anything else.
pub fn parse_segment_name(name: &str) -> Option<String> {
    let upper = name.to_ascii_uppercase();
    let stem = upper.strip_prefix("VTS_")?.strip_suffix(".VOB")?;
    let (title, part) = stem.split_once('_')?;

    let is_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if title.len() != 2 || !is_digits(title) || !is_digits(part) {
        return None;
    }

    Some(title.to_string())
}

/// Scans a source directory and groups its segment files by title set.
///
/// - Only direct children of `dir` are considered
/// - File names containing shell metacharacters are excluded (and logged)
/// - Files within a group are sorted lexicographically
/// - Groups are sorted by identifier
///
/// Durations are left unset; see [`crate::probe::estimate_duration`].
pub fn scan_segments(dir: &Path) -> Result<Vec<Group>, ScanError> {
    if !dir.is_dir() {
        return Err(ScanError::NotADirectory(dir.to_path_buf()));
    }

    let mut by_id: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let Some(name) = entry.file_name().to_str() else {
            debug!(path = %entry.path().display(), "skipping non UTF-8 file name");
            continue;
        };

        if has_unsafe_chars(name) {
            warn!(file = %name.escape_debug(), "excluding file with unsafe characters");
            continue;
        }

        if let Some(id) = parse_segment_name(name) {
            by_id.entry(id).or_default().push(entry.path().to_path_buf());
        }
    }

    let groups = by_id
        .into_iter()
        .map(|(id, mut files)| {
            files.sort();
            Group {
                id,
                files,
                duration_secs: None,
            }
        })
        .collect();

    Ok(groups)
}

/// Keeps the groups named in `selected`, in group order.
///
/// An empty selection keeps every group.
pub fn select_groups(groups: Vec<Group>, selected: &[String]) -> Vec<Group> {
    if selected.is_empty() {
        return groups;
    }
    groups
        .into_iter()
        .filter(|g| selected.iter().any(|id| id == &g.id))
        .collect()
}
