use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::assembler;
use crate::executor::Executor;
use crate::planner::Planner;
use crate::provider::{ModelRoute, ModelRouter};
use crate::store::{GenerationJob, JobStatus, JobStore, Outline};

use super::batch::{BatchScheduler, ScheduleOutcome};
use super::config::PipelineConfig;
use super::error::PipelineError;
use super::progress::{ProgressEvent, ProgressReporter};
use super::{ASSEMBLING_PERCENT, PLANNED_PERCENT};

/// What a resumed run does with the stored outline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeStrategy {
    /// Generate missing units from the stored outline.
    #[default]
    ReuseOutline,
    /// Plan again and take the fresh entries for missing indices. The unit
    /// count must not change.
    RegenerateOutline,
}

/// How a run ended. Job-level failures are already recorded in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    Failed(String),
    Cancelled,
    /// Another writer moved the job out of the phase this run was in.
    Interrupted(JobStatus),
}

pub struct Pipeline {
    store: JobStore,
    router: Arc<ModelRouter>,
    planner: Planner,
    scheduler: BatchScheduler,
    config: Arc<PipelineConfig>,
}

impl Pipeline {
    pub fn new(store: JobStore, router: Arc<ModelRouter>, config: Arc<PipelineConfig>) -> Self {
        let executor = Executor::new(config.retry.clone());
        let planner = Planner::new(executor.clone(), config.limits.clone());
        let scheduler = BatchScheduler::new(store.clone(), executor, config.batch_size);
        Self {
            store,
            router,
            planner,
            scheduler,
            config,
        }
    }

    /// Runs the job from wherever its stored state says it is.
    ///
    /// A pending job is planned first. A job with a stored outline only has
    /// its missing units generated, and a job already in `assembling` goes
    /// straight to assembly. Any error fails the job with the error's message.
    pub async fn run(
        &self,
        job_id: &str,
        strategy: ResumeStrategy,
        progress: &dyn ProgressReporter,
    ) -> PipelineOutcome {
        let span = info_span!("pipeline", job_id = %job_id, strategy = ?strategy);
        async {
            match self.run_inner(job_id, strategy, progress).await {
                Ok(outcome) => {
                    log::info!("Job {} finished: {:?}", job_id, outcome);
                    outcome
                }
                Err(e) => self.record_failure(job_id, &e, progress),
            }
        }
        .instrument(span)
        .await
    }

    async fn run_inner(
        &self,
        job_id: &str,
        strategy: ResumeStrategy,
        progress: &dyn ProgressReporter,
    ) -> Result<PipelineOutcome, PipelineError> {
        let job = self.load(job_id)?;
        if job.status.is_terminal() {
            return Ok(terminal_outcome(job.status));
        }
        let route = self
            .router
            .resolve(&job.model_selector)
            .ok_or_else(|| PipelineError::UnknownModel(job.model_selector.clone()))?;

        // Step 1: Outline
        let planned = match (&job.outline, strategy) {
            (None, _) => {
                if self.store.unit_count(job_id)? > 0 {
                    return Err(PipelineError::MissingOutline(job_id.to_string()));
                }
                self.plan(&job, route, None, progress).await?
            }
            (Some(existing), ResumeStrategy::RegenerateOutline)
                if job.status == JobStatus::Planning =>
            {
                self.plan(&job, route, Some(existing), progress).await?
            }
            (Some(existing), _) => Some(existing.clone()),
        };
        let Some(outline) = planned else {
            return self.interrupted(job_id, progress);
        };

        // Step 2: Units
        if job.status != JobStatus::Assembling {
            if !self.store.transition(
                job_id,
                &[JobStatus::Planning, JobStatus::GeneratingUnits],
                JobStatus::GeneratingUnits,
                "Generating units",
            )? {
                return self.interrupted(job_id, progress);
            }
            progress.report(ProgressEvent::Phase {
                status: JobStatus::GeneratingUnits,
                message: "Generating units".to_string(),
            });

            let job = self.load(job_id)?;
            let ceiling = self.config.unit_phase_timeout;
            let scheduled = tokio::time::timeout(
                ceiling,
                self.scheduler.run(&job, &outline, route, progress),
            )
            .await
            .map_err(|_| PipelineError::Timeout {
                seconds: ceiling.as_secs(),
            })?;

            match scheduled? {
                ScheduleOutcome::Finished => {}
                ScheduleOutcome::Stopped(status) => return Ok(self.stopped(status, progress)),
            }
        }

        // Step 3: Assemble
        if !self.store.transition(
            job_id,
            &[JobStatus::GeneratingUnits, JobStatus::Assembling],
            JobStatus::Assembling,
            "Assembling document",
        )? {
            return self.interrupted(job_id, progress);
        }
        self.store
            .raise_progress(job_id, ASSEMBLING_PERCENT, "Assembling document")?;
        progress.report(ProgressEvent::Phase {
            status: JobStatus::Assembling,
            message: "Assembling document".to_string(),
        });

        let artifact = {
            let _step = info_span!("assemble").entered();
            assembler::assemble(&self.store, job_id, false)?
        };

        if !self.store.complete(job_id, &[JobStatus::Assembling])? {
            return self.interrupted(job_id, progress);
        }
        progress.report(ProgressEvent::Completed {
            total_units: outline.total_units(),
        });
        log::info!(
            "Job {} assembled: {} units, {} characters",
            job_id,
            outline.total_units(),
            artifact.content.len()
        );
        Ok(PipelineOutcome::Completed)
    }

    /// Plans (or re-plans) the job. Returns `None` if the job could not be
    /// moved into `planning`.
    async fn plan(
        &self,
        job: &GenerationJob,
        route: &ModelRoute,
        existing: Option<&Outline>,
        progress: &dyn ProgressReporter,
    ) -> Result<Option<Outline>, PipelineError> {
        if !self.store.transition(
            &job.id,
            &[JobStatus::Pending, JobStatus::Planning],
            JobStatus::Planning,
            "Planning outline",
        )? {
            return Ok(None);
        }
        progress.report(ProgressEvent::Phase {
            status: JobStatus::Planning,
            message: "Planning outline".to_string(),
        });

        let outline = async {
            match existing {
                Some(existing) => self.planner.replan(route, &job.input, existing).await,
                None => self.planner.plan(route, &job.input).await,
            }
        }
        .instrument(info_span!("plan"))
        .await?;

        self.store.set_outline(&job.id, &outline)?;
        let message = format!("Planned {} units", outline.total_units());
        self.store
            .raise_progress(&job.id, PLANNED_PERCENT, &message)?;
        progress.report(ProgressEvent::Units {
            percent: PLANNED_PERCENT,
            completed_units: self.store.unit_count(&job.id)?,
            total_units: outline.total_units(),
        });
        Ok(Some(outline))
    }

    fn load(&self, job_id: &str) -> Result<GenerationJob, PipelineError> {
        self.store
            .get(job_id)?
            .ok_or_else(|| PipelineError::NotFound(job_id.to_string()))
    }

    fn interrupted(
        &self,
        job_id: &str,
        progress: &dyn ProgressReporter,
    ) -> Result<PipelineOutcome, PipelineError> {
        let status = self.load(job_id)?.status;
        log::info!("Job {} moved to {} by another writer, stopping", job_id, status);
        Ok(self.stopped(status, progress))
    }

    /// Ends a run that found its job moved on. A cancelled run reports the
    /// stop once its last batch is checkpointed.
    fn stopped(&self, status: JobStatus, progress: &dyn ProgressReporter) -> PipelineOutcome {
        if status == JobStatus::Cancelled {
            progress.report(ProgressEvent::Cancelled);
        }
        terminal_outcome(status)
    }

    fn record_failure(
        &self,
        job_id: &str,
        error: &PipelineError,
        progress: &dyn ProgressReporter,
    ) -> PipelineOutcome {
        let message = error.to_string();
        match self.store.fail(job_id, &JobStatus::ACTIVE, &message) {
            Ok(true) => {
                log::error!("Job {} failed: {}", job_id, message);
                progress.report(ProgressEvent::Failed {
                    error: message.clone(),
                });
            }
            Ok(false) => {
                log::warn!(
                    "Job {} failed ({}) but was no longer active; status left unchanged",
                    job_id,
                    message
                );
            }
            Err(e) => {
                log::error!(
                    "Job {} failed ({}) and the failure could not be recorded: {}",
                    job_id,
                    message,
                    e
                );
            }
        }
        PipelineOutcome::Failed(message)
    }
}

fn terminal_outcome(status: JobStatus) -> PipelineOutcome {
    match status {
        JobStatus::Completed => PipelineOutcome::Completed,
        JobStatus::Cancelled => PipelineOutcome::Cancelled,
        other => PipelineOutcome::Interrupted(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::executor::RetryPolicy;
    use crate::pipeline::NoopProgress;
    use crate::planner::PLAN_SYSTEM_PROMPT;
    use crate::provider::{ProviderErrorKind, StubProvider};
    use crate::store::GenerationInput;
    use std::time::Duration;

    const THREE_UNITS: &str = r#"{"title": "Lighthouses", "units": [
        {"index": 0, "title": "Origins", "kind": "opening"},
        {"index": 1, "title": "Keepers", "kind": "body"},
        {"index": 2, "title": "Automation", "kind": "closing"}
    ]}"#;

    fn pipeline(store: &JobStore, stub: Arc<StubProvider>) -> Pipeline {
        let router = ModelRouter::new("default").with_route("default", ModelRoute::single(stub, "m"));
        let mut config = PipelineConfig::default();
        config.retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            call_timeout: Duration::from_secs(5),
        };
        Pipeline::new(store.clone(), Arc::new(router), Arc::new(config))
    }

    fn submit(store: &JobStore, selector: &str) -> String {
        let input = GenerationInput {
            prompt: "History of lighthouses".to_string(),
            ..Default::default()
        };
        store.create_job("alice", &input, selector).unwrap().id
    }

    #[tokio::test]
    async fn test_fresh_run_completes() {
        let store = JobStore::new(Database::open_in_memory().unwrap());
        let stub = Arc::new(StubProvider::new("stub").reply_when(PLAN_SYSTEM_PROMPT, THREE_UNITS));
        let job_id = submit(&store, "default");

        let outcome = pipeline(&store, stub.clone())
            .run(&job_id, ResumeStrategy::ReuseOutline, &NoopProgress)
            .await;
        assert_eq!(outcome, PipelineOutcome::Completed);

        let job = store.get(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress_percent, 100);
        assert_eq!(job.completed_units, 3);
        assert_eq!(job.artifact_ref.as_deref(), Some(job_id.as_str()));

        let artifact = store.artifact(&job_id).unwrap().unwrap();
        assert!(artifact.content.starts_with("# Lighthouses\n"));
        assert!(!artifact.is_partial);
        assert_eq!(stub.call_count(), 4);
    }

    #[tokio::test]
    async fn test_plan_failure_fails_job_without_units() {
        let store = JobStore::new(Database::open_in_memory().unwrap());
        let stub = Arc::new(StubProvider::new("stub").reply_when(PLAN_SYSTEM_PROMPT, "no outline"));
        let job_id = submit(&store, "default");

        let outcome = pipeline(&store, stub)
            .run(&job_id, ResumeStrategy::ReuseOutline, &NoopProgress)
            .await;
        assert!(matches!(outcome, PipelineOutcome::Failed(ref m) if m.starts_with("Outline planning failed")));

        let job = store.get(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.completed_units, 0);
        assert!(job.outline.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_plan_error_fails_job() {
        let store = JobStore::new(Database::open_in_memory().unwrap());
        let stub = Arc::new(
            StubProvider::new("stub").fail_when(PLAN_SYSTEM_PROMPT, ProviderErrorKind::InvalidCredentials),
        );
        let job_id = submit(&store, "default");

        pipeline(&store, stub.clone())
            .run(&job_id, ResumeStrategy::ReuseOutline, &NoopProgress)
            .await;
        let job = store.get(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("invalid credentials"));
        assert_eq!(stub.call_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_model_fails_job() {
        let store = JobStore::new(Database::open_in_memory().unwrap());
        let job_id = submit(&store, "missing-model");

        let outcome = pipeline(&store, Arc::new(StubProvider::new("stub")))
            .run(&job_id, ResumeStrategy::ReuseOutline, &NoopProgress)
            .await;
        assert_eq!(
            outcome,
            PipelineOutcome::Failed("Unknown model selector 'missing-model'".to_string())
        );
    }

    #[tokio::test]
    async fn test_terminal_job_is_left_alone() {
        let store = JobStore::new(Database::open_in_memory().unwrap());
        let stub = Arc::new(StubProvider::new("stub"));
        let job_id = submit(&store, "default");
        store
            .transition(&job_id, &[JobStatus::Pending], JobStatus::Cancelled, "Cancelled")
            .unwrap();

        let outcome = pipeline(&store, stub.clone())
            .run(&job_id, ResumeStrategy::ReuseOutline, &NoopProgress)
            .await;
        assert_eq!(outcome, PipelineOutcome::Cancelled);
        assert_eq!(stub.call_count(), 0);
    }
}
