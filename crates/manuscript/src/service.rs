//! Job service facade.
//!
//! Ties admission, the worker pool, recovery and stall reporting together
//! behind one owner-scoped API. Every operation on an existing job checks
//! that the caller owns it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::admission::{AdmissionError, AdmissionGate};
use crate::broadcast::{JobProgressBroadcaster, JobProgressEvent};
use crate::config::{AdmissionSettings, Config, StallSettings};
use crate::db::{Database, DatabaseError};
use crate::error::{ConfigError, ManuscriptError, WorkerError};
use crate::pipeline::{Pipeline, PipelineConfig, ResumeStrategy};
use crate::provider::ModelRouter;
use crate::recovery::{RecommendedAction, Recovery, RecoveryError, StallMonitor};
use crate::store::{Artifact, GenerationInput, GenerationJob, JobStatus, JobStore, Unit};
use crate::worker::{JobRequest, WorkerPool};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Job {0} belongs to another owner")]
    Forbidden(String),

    #[error("Invalid request: {0}")]
    InvalidInput(String),

    #[error("Unknown model selector '{0}'")]
    UnknownModel(String),

    #[error("Submission rejected: {0}")]
    Admission(#[from] AdmissionError),

    #[error("{0}")]
    InvalidState(String),

    #[error("Job {0} has no generated content yet")]
    NoContent(String),

    #[error(transparent)]
    Recovery(RecoveryError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl From<RecoveryError> for ServiceError {
    fn from(err: RecoveryError) -> Self {
        match err {
            RecoveryError::NotFound(id) => ServiceError::NotFound(id),
            RecoveryError::NoContent(id) => ServiceError::NoContent(id),
            RecoveryError::Database(e) => ServiceError::Database(e),
            e @ RecoveryError::InvalidState { .. } => ServiceError::InvalidState(e.to_string()),
            other => ServiceError::Recovery(other),
        }
    }
}

/// Body of a submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub input: GenerationInput,
    #[serde(default)]
    pub model_selector: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: String,
    pub status: String,
}

/// What a status read returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub completed_units: usize,
    pub total_units: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub title: String,
    pub model_selector: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
    pub stalled: bool,
    pub idle_secs: u64,
    pub recommended_actions: Vec<RecommendedAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobStatusView>,
    pub total: u64,
}

pub struct JobService {
    store: JobStore,
    router: Arc<ModelRouter>,
    admission: AdmissionGate,
    recovery: Recovery,
    monitor: StallMonitor,
    pool: WorkerPool,
    broadcaster: JobProgressBroadcaster,
}

impl JobService {
    pub fn new(
        store: JobStore,
        router: Arc<ModelRouter>,
        pipeline_config: PipelineConfig,
        admission: AdmissionSettings,
        stall: StallSettings,
    ) -> Self {
        let broadcaster = JobProgressBroadcaster::default();
        let pipeline = Pipeline::new(store.clone(), Arc::clone(&router), Arc::new(pipeline_config));
        let pool = WorkerPool::new(Arc::new(pipeline), store.clone()).with_progress(broadcaster.clone());
        Self {
            admission: AdmissionGate::new(store.clone(), admission),
            recovery: Recovery::new(store.clone()),
            monitor: StallMonitor::new(store.clone(), stall),
            store,
            router,
            pool,
            broadcaster,
        }
    }

    /// Opens the configured database and builds providers from the config.
    pub fn from_config(config: &Config) -> Result<Self, ManuscriptError> {
        let path = config
            .resolved_database_path()
            .ok_or_else(|| ConfigError::Validation {
                message: "no database_path configured and no home directory found".to_string(),
            })?;
        let store = JobStore::new(Database::open(&path)?);
        let router = ModelRouter::from_config(config)?;
        Ok(Self::new(
            store,
            Arc::new(router),
            PipelineConfig::from_config(config),
            config.admission.clone(),
            config.stall.clone(),
        ))
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn stall_monitor(&self) -> &StallMonitor {
        &self.monitor
    }

    /// Admits, records and starts a job. Returns as soon as the run is dispatched.
    pub fn submit(
        &self,
        owner_id: &str,
        request: SubmitRequest,
    ) -> Result<SubmitResponse, ServiceError> {
        if owner_id.trim().is_empty() {
            return Err(ServiceError::InvalidInput("owner id is required".to_string()));
        }
        if request.input.prompt.trim().is_empty() {
            return Err(ServiceError::InvalidInput("prompt must not be empty".to_string()));
        }
        let selector = request
            .model_selector
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| self.router.default_selector().to_string());
        if !self.router.contains(&selector) {
            return Err(ServiceError::UnknownModel(selector));
        }

        let job = self.admission.admit_new(owner_id, &request.input, &selector)?;

        if let Err(e) = self.pool.submit(JobRequest::fresh(&job.id)) {
            self.store.fail(&job.id, &[JobStatus::Pending], &e.to_string())?;
            return Err(e.into());
        }

        log::info!("Job {} submitted by {} (model '{}')", job.id, owner_id, selector);
        Ok(SubmitResponse {
            job_id: job.id,
            status: "started".to_string(),
        })
    }

    pub fn status(&self, owner_id: &str, job_id: &str) -> Result<JobStatusView, ServiceError> {
        let job = self.authorize(owner_id, job_id)?;
        Ok(self.view(job))
    }

    pub fn list(
        &self,
        owner_id: &str,
        statuses: &[JobStatus],
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<JobListResponse, ServiceError> {
        let (jobs, total) = self.store.list(Some(owner_id), statuses, limit, offset)?;
        Ok(JobListResponse {
            jobs: jobs.into_iter().map(|job| self.view(job)).collect(),
            total,
        })
    }

    /// Restarts the pipeline for the job's missing work. Bringing a failed
    /// or cancelled job back counts against the owner's active-job limit.
    pub fn resume(
        &self,
        owner_id: &str,
        job_id: &str,
        strategy: ResumeStrategy,
    ) -> Result<JobStatusView, ServiceError> {
        let job = self.authorize(owner_id, job_id)?;
        if job.status.is_terminal() && job.status != JobStatus::Completed {
            self.admission.admit_reactivation(owner_id)?;
        }
        if self.pool.abort(job_id) {
            log::info!("Stopped the previous run of job {} before resuming", job_id);
        }
        self.recovery.prepare_resume(job_id, strategy)?;
        self.pool.restart(JobRequest::resume(job_id, strategy))?;
        self.status(owner_id, job_id)
    }

    /// Cancels the job. A running batch finishes and is kept; no new batch starts.
    pub fn cancel(&self, owner_id: &str, job_id: &str) -> Result<JobStatusView, ServiceError> {
        self.authorize(owner_id, job_id)?;
        let job = self.recovery.cancel(job_id)?;
        let mut event = JobProgressEvent::new(job_id, JobStatus::Cancelled, "Cancelled");
        event.progress_percent = job.progress_percent;
        event.completed_units = job.completed_units;
        event.total_units = job.total_units;
        self.broadcaster.send(event);
        Ok(self.view(job))
    }

    /// Current units rendered as a document; nothing is stored.
    pub fn get_partial(&self, owner_id: &str, job_id: &str) -> Result<Artifact, ServiceError> {
        self.authorize(owner_id, job_id)?;
        Ok(self.recovery.get_partial(job_id)?)
    }

    /// Stops any run of the job, then stores the current units as its
    /// artifact and completes it.
    pub fn save_partial(&self, owner_id: &str, job_id: &str) -> Result<Artifact, ServiceError> {
        self.authorize(owner_id, job_id)?;
        if self.pool.abort(job_id) {
            log::info!("Stopped the run of job {} to save its partial result", job_id);
        }
        let artifact = self.recovery.save_partial(job_id)?;
        let completed_units = self.store.unit_count(job_id)?;
        self.broadcaster
            .send(JobProgressEvent::completed(job_id, completed_units));
        Ok(artifact)
    }

    /// The stored artifact, if the job has one.
    pub fn artifact(&self, owner_id: &str, job_id: &str) -> Result<Artifact, ServiceError> {
        self.authorize(owner_id, job_id)?;
        self.store
            .artifact(job_id)?
            .ok_or_else(|| ServiceError::NoContent(job_id.to_string()))
    }

    pub fn units(&self, owner_id: &str, job_id: &str) -> Result<Vec<Unit>, ServiceError> {
        self.authorize(owner_id, job_id)?;
        Ok(self.store.units(job_id)?)
    }

    /// Stops any run of the job and deletes it with its units and artifact.
    pub fn delete(&self, owner_id: &str, job_id: &str) -> Result<(), ServiceError> {
        self.authorize(owner_id, job_id)?;
        self.pool.abort(job_id);
        if !self.store.delete(job_id)? {
            return Err(ServiceError::NotFound(job_id.to_string()));
        }
        log::info!("Deleted job {}", job_id);
        Ok(())
    }

    /// Subscribes to progress events of all jobs.
    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.broadcaster.subscribe()
    }

    /// Starts the periodic stall sweep.
    pub fn spawn_stall_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        self.monitor.clone().spawn_sweeper(interval)
    }

    /// Stops accepting work and waits up to `grace` for running jobs.
    pub async fn shutdown(&self, grace: Duration) {
        self.pool.shutdown_and_wait(grace).await;
    }

    fn authorize(&self, owner_id: &str, job_id: &str) -> Result<GenerationJob, ServiceError> {
        let job = self
            .store
            .get(job_id)?
            .ok_or_else(|| ServiceError::NotFound(job_id.to_string()))?;
        if job.owner_id != owner_id {
            log::warn!("Owner {} denied access to job {}", owner_id, job_id);
            return Err(ServiceError::Forbidden(job_id.to_string()));
        }
        Ok(job)
    }

    fn view(&self, job: GenerationJob) -> JobStatusView {
        let assessment = self.monitor.assess(&job, Utc::now());
        JobStatusView {
            title: job.document_title(),
            job_id: job.id,
            status: job.status,
            progress_percent: job.progress_percent,
            completed_units: job.completed_units,
            total_units: job.total_units,
            error_message: job.error_message,
            message: job.message,
            model_selector: job.model_selector,
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
            artifact_ref: job.artifact_ref,
            stalled: assessment.stalled,
            idle_secs: assessment.idle_secs,
            recommended_actions: assessment.recommended_actions,
        }
    }
}
