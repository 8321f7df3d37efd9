use crate::pipeline::{PipelineOutcome, ResumeStrategy};

/// A request to run the pipeline for a stored job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub job_id: String,
    pub strategy: ResumeStrategy,
}

impl JobRequest {
    /// First run of a freshly submitted job.
    pub fn fresh(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            strategy: ResumeStrategy::ReuseOutline,
        }
    }

    pub fn resume(job_id: impl Into<String>, strategy: ResumeStrategy) -> Self {
        Self {
            job_id: job_id.into(),
            strategy,
        }
    }
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub job_id: String,
    pub outcome: PipelineOutcome,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        self.outcome == PipelineOutcome::Completed
    }
}
