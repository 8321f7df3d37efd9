use crate::broadcast::job_progress::{JobProgressBroadcaster, JobProgressTracker};
use crate::store::{GenerationJob, JobStatus};

/// Events emitted by the pipeline during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Phase {
        status: JobStatus,
        message: String,
    },
    Units {
        percent: u8,
        completed_units: usize,
        total_units: usize,
    },
    Completed {
        total_units: usize,
    },
    Failed {
        error: String,
    },
    Cancelled,
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// No-op reporter for unit tests.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Bridges pipeline events to the broadcast channel.
pub struct BroadcastProgress {
    tracker: JobProgressTracker,
}

impl BroadcastProgress {
    pub fn new(broadcaster: &JobProgressBroadcaster, job: &GenerationJob) -> Self {
        Self {
            tracker: broadcaster.start_job(
                &job.id,
                job.progress_percent,
                job.completed_units,
                job.total_units,
            ),
        }
    }
}

impl ProgressReporter for BroadcastProgress {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Phase { status, message } => {
                self.tracker.update_phase(status, &message);
            }
            ProgressEvent::Units {
                percent,
                completed_units,
                total_units,
            } => {
                self.tracker.update_progress(
                    JobStatus::GeneratingUnits,
                    percent,
                    completed_units,
                    total_units,
                    &format!("Generated {} of {} units", completed_units, total_units),
                );
            }
            ProgressEvent::Completed { total_units } => self.tracker.completed(total_units),
            ProgressEvent::Failed { error } => self.tracker.failed(&error),
            ProgressEvent::Cancelled => self.tracker.cancelled(),
        }
    }
}
