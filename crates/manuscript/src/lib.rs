pub mod admission;
pub mod assembler;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod logging;
pub mod pipeline;
pub mod planner;
pub mod provider;
pub mod recovery;
pub mod secrets;
pub mod service;
pub mod store;
pub mod worker;

pub use admission::{AdmissionError, AdmissionGate};
pub use broadcast::{JobProgressBroadcaster, JobProgressEvent};
pub use config::{load_config, Config};
pub use error::{ConfigError, ManuscriptError, Result, WorkerError};
pub use executor::{Executor, ExecutorError, RetryPolicy};
pub use pipeline::{Pipeline, PipelineConfig, PipelineError, PipelineOutcome, ResumeStrategy};
pub use planner::{PlanError, Planner};
pub use provider::{GenerationProvider, ModelRoute, ModelRouter, ProviderError, ProviderErrorKind};
pub use recovery::{RecommendedAction, Recovery, RecoveryError, StallAssessment, StallMonitor};
pub use secrets::{resolve_secret, resolve_secret_optional, SecretError};
pub use service::{JobService, ServiceError, SubmitRequest, SubmitResponse};
pub use store::{GenerationInput, GenerationJob, JobStatus, JobStore};
pub use worker::WorkerPool;
