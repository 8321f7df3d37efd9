//! Stall detection and the recovery operations.
//!
//! Everything here works from the job store alone, so it applies equally to
//! a job whose background task is still running, has stalled, or is gone.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::assembler::{self, AssemblyError};
use crate::config::StallSettings;
use crate::db::DatabaseError;
use crate::pipeline::ResumeStrategy;
use crate::store::{Artifact, GenerationJob, JobStatus, JobStore};

/// Statuses a job can be resumed or partially saved from.
const NOT_COMPLETED: [JobStatus; 6] = [
    JobStatus::Pending,
    JobStatus::Planning,
    JobStatus::GeneratingUnits,
    JobStatus::Assembling,
    JobStatus::Failed,
    JobStatus::Cancelled,
];

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Cannot {operation} job {job_id} while it is {status}")]
    InvalidState {
        job_id: String,
        status: JobStatus,
        operation: &'static str,
    },

    #[error("Job {0} has no generated content yet")]
    NoContent(String),

    #[error("Assembly failed: {0}")]
    Assembly(AssemblyError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<AssemblyError> for RecoveryError {
    fn from(err: AssemblyError) -> Self {
        match err {
            AssemblyError::NotFound(id) => RecoveryError::NotFound(id),
            AssemblyError::NoContent(id) => RecoveryError::NoContent(id),
            AssemblyError::Database(e) => RecoveryError::Database(e),
            other => RecoveryError::Assembly(other),
        }
    }
}

/// An operation a client can take on a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Resume,
    Cancel,
    GetPartial,
    SavePartial,
}

/// Result of checking one job for a stall.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StallAssessment {
    pub stalled: bool,
    /// Seconds since the job record last changed.
    pub idle_secs: u64,
    /// Idle budget for the job's status; `None` for terminal jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_secs: Option<u64>,
    pub recommended_actions: Vec<RecommendedAction>,
}

/// Flags non-terminal jobs whose `updated_at` stopped advancing.
///
/// Never writes to the store.
#[derive(Clone)]
pub struct StallMonitor {
    store: JobStore,
    settings: StallSettings,
}

impl StallMonitor {
    pub fn new(store: JobStore, settings: StallSettings) -> Self {
        Self { store, settings }
    }

    /// Idle budget for `status`; `None` when the status cannot stall.
    pub fn budget_for(&self, status: JobStatus) -> Option<Duration> {
        let secs = match status {
            JobStatus::Pending => self.settings.pending_secs,
            JobStatus::Planning => self.settings.planning_secs,
            JobStatus::GeneratingUnits => self.settings.generating_units_secs,
            JobStatus::Assembling => self.settings.assembling_secs,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => return None,
        };
        Some(Duration::from_secs(secs))
    }

    pub fn assess(&self, job: &GenerationJob, now: DateTime<Utc>) -> StallAssessment {
        let idle_secs = (now - job.updated_at).num_seconds().max(0) as u64;
        let budget = self.budget_for(job.status);
        let stalled = budget.is_some_and(|b| idle_secs > b.as_secs());
        let has_units = job.completed_units > 0;

        let mut actions = Vec::new();
        if stalled {
            actions.extend([RecommendedAction::Resume, RecommendedAction::Cancel]);
        } else if matches!(job.status, JobStatus::Failed | JobStatus::Cancelled) {
            actions.push(RecommendedAction::Resume);
        }
        if has_units && (stalled || matches!(job.status, JobStatus::Failed | JobStatus::Cancelled))
        {
            actions.extend([RecommendedAction::GetPartial, RecommendedAction::SavePartial]);
        }

        StallAssessment {
            stalled,
            idle_secs,
            budget_secs: budget.map(|b| b.as_secs()),
            recommended_actions: actions,
        }
    }

    /// Lists every stalled job with its assessment.
    pub fn sweep(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(GenerationJob, StallAssessment)>, DatabaseError> {
        let (jobs, _) = self.store.list(None, &JobStatus::ACTIVE, None, None)?;
        Ok(jobs
            .into_iter()
            .filter_map(|job| {
                let assessment = self.assess(&job, now);
                assessment.stalled.then_some((job, assessment))
            })
            .collect())
    }

    /// Starts a task that logs stalled jobs every `interval`.
    pub fn spawn_sweeper(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.sweep(Utc::now()) {
                    Ok(stalled) => {
                        for (job, assessment) in stalled {
                            tracing::warn!(
                                job_id = %job.id,
                                owner_id = %job.owner_id,
                                status = %job.status,
                                idle_secs = assessment.idle_secs,
                                completed_units = job.completed_units,
                                total_units = job.total_units,
                                "job appears stalled"
                            );
                        }
                    }
                    Err(e) => log::error!("Stall sweep failed: {}", e),
                }
            }
        })
    }
}

/// What a prepared resume will do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePlan {
    /// Status the job was moved to.
    pub status: JobStatus,
    /// Unit indices still to be generated.
    pub missing: Vec<usize>,
}

/// Recovery operations over the job store.
#[derive(Clone)]
pub struct Recovery {
    store: JobStore,
}

impl Recovery {
    pub fn new(store: JobStore) -> Self {
        Self { store }
    }

    fn load(&self, job_id: &str) -> Result<GenerationJob, RecoveryError> {
        self.store
            .get(job_id)?
            .ok_or_else(|| RecoveryError::NotFound(job_id.to_string()))
    }

    /// Moves the job back into the phase it has to continue from.
    ///
    /// No stored outline (or a regenerated one requested) means `planning`,
    /// nothing missing means `assembling`, anything else `generating_units`.
    /// The caller starts the pipeline afterwards.
    pub fn prepare_resume(
        &self,
        job_id: &str,
        strategy: ResumeStrategy,
    ) -> Result<ResumePlan, RecoveryError> {
        let job = self.load(job_id)?;
        if job.status == JobStatus::Completed {
            return Err(RecoveryError::InvalidState {
                job_id: job_id.to_string(),
                status: job.status,
                operation: "resume",
            });
        }

        let persisted = self.store.unit_indices(job_id)?;
        let (status, missing) = match &job.outline {
            None => (JobStatus::Planning, Vec::new()),
            Some(outline) => {
                let missing: Vec<usize> = (0..outline.total_units())
                    .filter(|i| !persisted.contains(i))
                    .collect();
                let status = if missing.is_empty() {
                    JobStatus::Assembling
                } else if strategy == ResumeStrategy::RegenerateOutline {
                    JobStatus::Planning
                } else {
                    JobStatus::GeneratingUnits
                };
                (status, missing)
            }
        };

        if !self
            .store
            .transition(job_id, &NOT_COMPLETED, status, "Resuming")?
        {
            let current = self.load(job_id)?;
            return Err(RecoveryError::InvalidState {
                job_id: job_id.to_string(),
                status: current.status,
                operation: "resume",
            });
        }

        log::info!(
            "Resuming job {} from {} ({} unit(s) missing)",
            job_id,
            status,
            missing.len()
        );
        Ok(ResumePlan { status, missing })
    }

    /// Cancels the job. Cancelling a cancelled job is a no-op.
    pub fn cancel(&self, job_id: &str) -> Result<GenerationJob, RecoveryError> {
        let job = self.load(job_id)?;
        if job.status == JobStatus::Cancelled {
            return Ok(job);
        }
        if !self
            .store
            .transition(job_id, &JobStatus::ACTIVE, JobStatus::Cancelled, "Cancelled")?
        {
            let current = self.load(job_id)?;
            if current.status != JobStatus::Cancelled {
                return Err(RecoveryError::InvalidState {
                    job_id: job_id.to_string(),
                    status: current.status,
                    operation: "cancel",
                });
            }
        }
        log::info!("Cancelled job {}", job_id);
        self.load(job_id)
    }

    /// Renders the current units without storing anything.
    pub fn get_partial(&self, job_id: &str) -> Result<Artifact, RecoveryError> {
        Ok(assembler::assemble(&self.store, job_id, true)?)
    }

    /// Stores an artifact from the current units and completes the job.
    pub fn save_partial(&self, job_id: &str) -> Result<Artifact, RecoveryError> {
        let job = self.load(job_id)?;
        if job.status == JobStatus::Completed {
            return Err(RecoveryError::InvalidState {
                job_id: job_id.to_string(),
                status: job.status,
                operation: "save partial content of",
            });
        }

        let artifact = assembler::assemble(&self.store, job_id, true)?;
        if !self.store.insert_artifact(&artifact)? {
            log::warn!("Job {} already had an artifact, replacing is not allowed", job_id);
        }
        if !self.store.complete(job_id, &NOT_COMPLETED)? {
            let current = self.load(job_id)?;
            return Err(RecoveryError::InvalidState {
                job_id: job_id.to_string(),
                status: current.status,
                operation: "save partial content of",
            });
        }
        log::info!(
            "Saved partial artifact for job {} ({} of {} units)",
            job_id,
            job.completed_units,
            job.total_units
        );
        Ok(self.store.artifact(job_id)?.unwrap_or(artifact))
    }
}
