//! Job event fan-out.
//!
//! Events are broadcast to every live subscriber. Delivery is best effort:
//! nothing is replayed to late subscribers, and a subscriber that falls too
//! far behind skips the events it missed.

use crate::job::{JobSummary, TaskStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Buffered events per subscriber before it starts lagging.
pub const EVENT_BUFFER: usize = 256;

/// Something observers may want to know about the live job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// Task progress or status change.
    Progress {
        job_id: String,
        group_id: String,
        status: TaskStatus,
        progress: u8,
        message: String,
    },
    /// A task failed; the job continues.
    Error {
        job_id: String,
        group_id: String,
        message: String,
    },
    /// The job visited every task.
    Complete { summary: JobSummary },
    /// The job was stopped by the user.
    Stopped { summary: JobSummary },
}

impl JobEvent {
    /// Event name used on push transports.
    pub fn kind(&self) -> &'static str {
        match self {
            JobEvent::Progress { .. } => "progress",
            JobEvent::Error { .. } => "error",
            JobEvent::Complete { .. } => "complete",
            JobEvent::Stopped { .. } => "stopped",
        }
    }
}

/// Broadcast hub for [`JobEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    /// Sends `event` to current subscribers. Having none is not an error.
    pub fn publish(&self, event: JobEvent) {
        let kind = event.kind();
        match self.tx.send(event) {
            Ok(receivers) => trace!(kind, receivers, "event published"),
            Err(_) => trace!(kind, "event dropped, no subscribers"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
