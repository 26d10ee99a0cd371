//! Conversion history.
//!
//! Every job that completes or is stopped leaves one [`HistoryEntry`] in a
//! capped JSON list, oldest first.

use crate::format::format_duration;
use crate::job::{elapsed_secs, Job, Outcome, TaskStatus};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Error type for history operations
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history file IO failed: {0}")]
    Io(#[from] io::Error),

    #[error("history serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Record of one finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    /// Unix timestamp (milliseconds) when the entry was written.
    pub timestamp: i64,
    pub job_id: String,
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    pub preset: String,
    pub crf: u8,
    pub audio_bitrate: String,
    pub group_count: usize,
    pub completed_groups: usize,
    pub failed_groups: usize,
    pub total_duration_secs: f64,
    pub total_size_bytes: u64,
    pub status: Outcome,
    pub started_at: i64,
    pub ended_at: i64,
    pub elapsed_secs: f64,
}

impl HistoryEntry {
    /// Builds the entry for a job that finished at `now`.
    pub fn from_job(job: &Job, now: i64) -> Self {
        let ended_at = job.ended_at.unwrap_or(now);
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: now,
            job_id: job.id.clone(),
            source_path: job.source_path.clone(),
            output_path: job.output_path.clone(),
            preset: job.params.preset.clone(),
            crf: job.params.crf,
            audio_bitrate: job.params.audio_bitrate.clone(),
            group_count: job.tasks.len(),
            completed_groups: job.count(TaskStatus::Success),
            failed_groups: job.count(TaskStatus::Error),
            total_duration_secs: job.total_duration_secs(),
            total_size_bytes: job.total_size_bytes(),
            status: job.outcome(),
            started_at: job.started_at,
            ended_at,
            elapsed_secs: job
                .elapsed_secs
                .unwrap_or_else(|| elapsed_secs(job.started_at, ended_at)),
        }
    }
}

/// Aggregate figures over the whole history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryStats {
    pub total_conversions: usize,
    pub successful: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub partial: usize,
    pub total_groups_converted: usize,
    pub total_size_bytes: u64,
    pub total_time_secs: f64,
    pub total_time_formatted: String,
    /// Percentage of successful conversions, one decimal.
    pub success_rate: f64,
}

impl HistoryStats {
    pub fn from_entries(entries: &[HistoryEntry]) -> Self {
        let count = |outcome: Outcome| entries.iter().filter(|e| e.status == outcome).count();
        let total = entries.len();
        let successful = count(Outcome::Success);
        let total_time_secs: f64 = entries.iter().map(|e| e.elapsed_secs).sum();

        let success_rate = if total > 0 {
            ((successful as f64 / total as f64) * 1000.0).round() / 10.0
        } else {
            0.0
        };

        Self {
            total_conversions: total,
            successful,
            failed: count(Outcome::Error),
            cancelled: count(Outcome::Cancelled),
            partial: count(Outcome::Partial),
            total_groups_converted: entries.iter().map(|e| e.completed_groups).sum(),
            total_size_bytes: entries.iter().map(|e| e.total_size_bytes).sum(),
            total_time_secs,
            total_time_formatted: format_duration(total_time_secs),
            success_rate,
        }
    }
}

/// JSON-file backed history list.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
    max_entries: usize,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>, max_entries: usize) -> Self {
        Self {
            path: path.into(),
            max_entries: max_entries.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All entries, oldest first. Unreadable files yield an empty list.
    pub fn load(&self) -> Vec<HistoryEntry> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read history");
                return Vec::new();
            }
        };

        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "ignoring unreadable history");
            Vec::new()
        })
    }

    /// Appends `entry`, evicting the oldest entries beyond the cap.
    pub fn append(&self, entry: HistoryEntry) -> Result<(), HistoryError> {
        let mut entries = self.load();
        entries.push(entry);
        if entries.len() > self.max_entries {
            let excess = entries.len() - self.max_entries;
            entries.drain(..excess);
        }
        self.write(&entries)
    }

    pub fn stats(&self) -> HistoryStats {
        HistoryStats::from_entries(&self.load())
    }

    pub fn clear(&self) -> Result<(), HistoryError> {
        self.write(&[])
    }

    fn write(&self, entries: &[HistoryEntry]) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::EncodeParams;
    use crate::job::JobRequest;
    use tempfile::TempDir;

    fn make_entry(status: Outcome, completed: usize, size: u64, elapsed: f64) -> HistoryEntry {
        HistoryEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: 0,
            job_id: "job".to_string(),
            source_path: PathBuf::from("/dvd"),
            output_path: PathBuf::from("/out"),
            preset: "medium".to_string(),
            crf: 18,
            audio_bitrate: "192k".to_string(),
            group_count: 3,
            completed_groups: completed,
            failed_groups: 0,
            total_duration_secs: 0.0,
            total_size_bytes: size,
            status,
            started_at: 0,
            ended_at: 0,
            elapsed_secs: elapsed,
        }
    }

    #[test]
    fn test_from_job_counts_tasks() {
        let ids = vec!["01".to_string(), "02".to_string(), "03".to_string()];
        let mut job = Job::new(
            JobRequest {
                source_path: PathBuf::from("/dvd"),
                output_path: PathBuf::from("/out"),
                params: EncodeParams::default(),
                selected_groups: vec![],
            },
            &ids,
        );
        job.started_at = 1_000;
        job.tasks[0].succeed(600.0, 1_000_000);
        job.tasks[1].fail("boom");
        job.complete(61_000);

        let entry = HistoryEntry::from_job(&job, 62_000);

        assert_eq!(entry.group_count, 3);
        assert_eq!(entry.completed_groups, 1);
        assert_eq!(entry.failed_groups, 1);
        assert_eq!(entry.total_size_bytes, 1_000_000);
        assert_eq!(entry.total_duration_secs, 600.0);
        assert_eq!(entry.status, Outcome::Partial);
        assert_eq!(entry.elapsed_secs, 60.0);
        assert_eq!(entry.ended_at, 61_000);
    }

    #[test]
    fn test_from_stopped_job_is_cancelled() {
        let ids = vec!["01".to_string()];
        let mut job = Job::new(
            JobRequest {
                source_path: PathBuf::from("/dvd"),
                output_path: PathBuf::from("/out"),
                params: EncodeParams::default(),
                selected_groups: vec![],
            },
            &ids,
        );
        job.started_at = 0;
        job.stop(30_000);

        let entry = HistoryEntry::from_job(&job, 31_000);
        assert_eq!(entry.status, Outcome::Cancelled);
        assert_eq!(entry.elapsed_secs, 30.0);
    }

    #[test]
    fn test_append_caps_entries() {
        let temp = TempDir::new().unwrap();
        let store = HistoryStore::new(temp.path().join("history.json"), 3);

        for i in 0..5 {
            store
                .append(make_entry(Outcome::Success, i, 0, 0.0))
                .unwrap();
        }

        let entries = store.load();
        let completed: Vec<_> = entries.iter().map(|e| e.completed_groups).collect();
        assert_eq!(completed, vec![2, 3, 4]);
    }

    #[test]
    fn test_stats() {
        let temp = TempDir::new().unwrap();
        let store = HistoryStore::new(temp.path().join("history.json"), 100);
        store.append(make_entry(Outcome::Success, 3, 1_000, 3600.0)).unwrap();
        store.append(make_entry(Outcome::Success, 2, 500, 60.0)).unwrap();
        store.append(make_entry(Outcome::Partial, 1, 250, 1.0)).unwrap();

        let stats = store.stats();
        assert_eq!(stats.total_conversions, 3);
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.partial, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.cancelled, 0);
        assert_eq!(stats.total_groups_converted, 6);
        assert_eq!(stats.total_size_bytes, 1_750);
        assert_eq!(stats.total_time_formatted, "01:01:01");
        assert_eq!(stats.success_rate, 66.7);
    }

    #[test]
    fn test_empty_and_corrupt_history() {
        let temp = TempDir::new().unwrap();
        let store = HistoryStore::new(temp.path().join("history.json"), 100);
        assert!(store.load().is_empty());
        assert_eq!(store.stats().success_rate, 0.0);

        fs::write(store.path(), "[{broken").unwrap();
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_clear() {
        let temp = TempDir::new().unwrap();
        let store = HistoryStore::new(temp.path().join("history.json"), 100);
        store.append(make_entry(Outcome::Error, 0, 0, 0.0)).unwrap();

        store.clear().unwrap();
        assert!(store.load().is_empty());
        assert!(store.path().exists());
    }
}
