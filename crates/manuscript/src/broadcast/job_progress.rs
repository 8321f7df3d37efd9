//! Job progress broadcaster for real-time job status streaming.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::store::JobStatus;

/// Progress event for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressEvent {
    /// Unique job identifier.
    pub job_id: String,
    /// Status the job is in after this event.
    pub status: JobStatus,
    pub progress_percent: u8,
    pub completed_units: usize,
    pub total_units: usize,
    /// Human-readable message describing current activity.
    pub message: String,
    /// Timestamp of this event.
    pub timestamp: DateTime<Utc>,
    /// Error message (set on failure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobProgressEvent {
    /// Creates a new progress event.
    pub fn new(job_id: &str, status: JobStatus, message: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            status,
            progress_percent: 0,
            completed_units: 0,
            total_units: 0,
            message: message.to_string(),
            timestamp: Utc::now(),
            error: None,
        }
    }

    /// Creates a completion event.
    pub fn completed(job_id: &str, total_units: usize) -> Self {
        Self {
            progress_percent: 100,
            completed_units: total_units,
            total_units,
            ..Self::new(job_id, JobStatus::Completed, "Completed")
        }
    }

    /// Creates a failure event.
    pub fn failed(job_id: &str, error: &str) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(job_id, JobStatus::Failed, "Generation failed")
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Broadcasts job progress events for streaming.
#[derive(Clone)]
pub struct JobProgressBroadcaster {
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl JobProgressBroadcaster {
    /// Creates a new job progress broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends a progress event to all subscribers.
    pub fn send(&self, event: JobProgressEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    /// Creates a new subscriber for progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.sender.subscribe()
    }

    /// Creates a tracker for one pipeline run, seeded with the job's stored counters.
    pub fn start_job(
        &self,
        job_id: &str,
        progress_percent: u8,
        completed_units: usize,
        total_units: usize,
    ) -> JobProgressTracker {
        JobProgressTracker {
            job_id: job_id.to_string(),
            snapshot: Mutex::new(Snapshot {
                progress_percent,
                completed_units,
                total_units,
            }),
            sender: Arc::clone(&self.sender),
        }
    }

    /// Gets the inner sender for creating trackers.
    pub fn sender(&self) -> Arc<broadcast::Sender<JobProgressEvent>> {
        Arc::clone(&self.sender)
    }
}

impl Default for JobProgressBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    progress_percent: u8,
    completed_units: usize,
    total_units: usize,
}

/// Tracks progress for a single job.
///
/// Remembers the last counters so phase-only updates still carry them.
pub struct JobProgressTracker {
    job_id: String,
    snapshot: Mutex<Snapshot>,
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl JobProgressTracker {
    fn snapshot(&self) -> MutexGuard<'_, Snapshot> {
        self.snapshot.lock().unwrap_or_else(|poisoned| {
            log::warn!("JobProgressTracker lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn emit(&self, mut event: JobProgressEvent) {
        let snapshot = *self.snapshot();
        event.progress_percent = event.progress_percent.max(snapshot.progress_percent);
        event.completed_units = event.completed_units.max(snapshot.completed_units);
        event.total_units = event.total_units.max(snapshot.total_units);
        let _ = self.sender.send(event);
    }

    /// Announces a status change.
    pub fn update_phase(&self, status: JobStatus, message: &str) {
        self.emit(JobProgressEvent::new(&self.job_id, status, message));
    }

    /// Records new counters and announces them. Progress never goes down.
    pub fn update_progress(
        &self,
        status: JobStatus,
        progress_percent: u8,
        completed_units: usize,
        total_units: usize,
        message: &str,
    ) {
        {
            let mut snapshot = self.snapshot();
            snapshot.progress_percent = snapshot.progress_percent.max(progress_percent.min(100));
            snapshot.completed_units = completed_units;
            snapshot.total_units = total_units;
        }
        let mut event = JobProgressEvent::new(&self.job_id, status, message);
        event.completed_units = completed_units;
        event.total_units = total_units;
        self.emit(event);
    }

    /// Marks the job as completed.
    pub fn completed(&self, total_units: usize) {
        self.emit(JobProgressEvent::completed(&self.job_id, total_units));
    }

    /// Marks the job as failed with an error message.
    pub fn failed(&self, error: &str) {
        self.emit(JobProgressEvent::failed(&self.job_id, error));
    }

    /// Marks the job as cancelled.
    pub fn cancelled(&self) {
        self.emit(JobProgressEvent::new(
            &self.job_id,
            JobStatus::Cancelled,
            "Cancelled",
        ));
    }
}
