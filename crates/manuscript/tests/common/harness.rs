//! Test harness for isolated pipeline runs.
//!
//! Each `TestHarness` owns a temp directory holding a fresh SQLite file, a
//! primary stub provider and an optional fallback stub, routed under the
//! `default` selector.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use manuscript::config::{AdmissionSettings, StallSettings};
use manuscript::db::Database;
use manuscript::pipeline::{ProgressEvent, ProgressReporter};
use manuscript::provider::StubProvider;
use manuscript::store::{word_count, Outline, Unit};
use manuscript::{
    GenerationInput, GenerationJob, JobService, JobStatus, JobStore, ModelRoute, ModelRouter,
    Pipeline, PipelineConfig,
};

use super::builders::PipelineConfigBuilder;

pub const OWNER: &str = "owner-1";

/// Test harness providing an isolated store and scripted providers.
pub struct TestHarness {
    /// Keeps the database file alive for the harness lifetime.
    _temp_dir: TempDir,
    pub store: JobStore,
    pub primary: Arc<StubProvider>,
    pub fallback: Option<Arc<StubProvider>>,
    config: PipelineConfig,
}

impl TestHarness {
    pub fn new(primary: StubProvider) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db = Database::open(&temp_dir.path().join("manuscript.db"))
            .expect("Failed to open test database");
        Self {
            _temp_dir: temp_dir,
            store: JobStore::new(db),
            primary: Arc::new(primary),
            fallback: None,
            config: PipelineConfigBuilder::new().build(),
        }
    }

    pub fn with_fallback(mut self, fallback: StubProvider) -> Self {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn router(&self) -> Arc<ModelRouter> {
        let mut route = ModelRoute::single(self.primary.clone(), "primary-model");
        if let Some(fallback) = &self.fallback {
            route = route.with_fallback(fallback.clone(), "fallback-model");
        }
        Arc::new(ModelRouter::new("default").with_route("default", route))
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(
            self.store.clone(),
            self.router(),
            Arc::new(self.config.clone()),
        )
    }

    pub fn service(&self, admission: AdmissionSettings, stall: StallSettings) -> JobService {
        JobService::new(
            self.store.clone(),
            self.router(),
            self.config.clone(),
            admission,
            stall,
        )
    }

    /// Creates a pending job for `prompt`.
    pub fn create_job(&self, prompt: &str) -> GenerationJob {
        let input = GenerationInput {
            prompt: prompt.to_string(),
            ..Default::default()
        };
        self.store
            .create_job(OWNER, &input, "default")
            .expect("Failed to create job")
    }

    /// Creates a job that already has `outline` and the given units stored,
    /// then fails it the way a crashed run would leave it.
    pub fn seed_failed_job(&self, outline: &Outline, stored: &[usize]) -> GenerationJob {
        let job = self.create_job("Seeded request");
        self.store
            .set_outline(&job.id, outline)
            .expect("Failed to store outline");
        for &index in stored {
            self.seed_unit(&job.id, outline, index);
        }
        self.store
            .fail(&job.id, &JobStatus::ACTIVE, "worker crashed")
            .expect("Failed to fail job");
        self.job(&job.id)
    }

    pub fn seed_unit(&self, job_id: &str, outline: &Outline, index: usize) {
        let entry = &outline.units[index];
        let content = format!("Seeded content for {}", entry.title);
        self.store
            .insert_unit(&Unit {
                job_id: job_id.to_string(),
                index,
                title: entry.title.clone(),
                kind: entry.kind,
                size: word_count(&content),
                content,
                is_fallback: false,
                created_at: chrono::Utc::now(),
            })
            .expect("Failed to store unit");
    }

    pub fn job(&self, job_id: &str) -> GenerationJob {
        self.store
            .get(job_id)
            .expect("Failed to read job")
            .expect("Job not found")
    }
}

/// Records every progress event of a run.
#[derive(Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Percentages carried by `Units` events, in order.
    pub fn percents(&self) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Units { percent, .. } => Some(percent),
                _ => None,
            })
            .collect()
    }
}

impl ProgressReporter for RecordingProgress {
    fn report(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}
