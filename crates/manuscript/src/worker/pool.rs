//! In-process registry of running pipeline tasks.
//!
//! Each job runs as its own tokio task, detached from whatever request
//! started it. The store is the only handoff: a task only needs a job id,
//! and anything it leaves behind can be picked up again by a resume.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::broadcast::JobProgressBroadcaster;
use crate::error::WorkerError;
use crate::pipeline::{BroadcastProgress, NoopProgress, Pipeline, ProgressReporter};
use crate::store::JobStore;
use crate::worker::job::{JobRequest, JobResult};

struct RunningJob {
    run_id: u64,
    handle: JoinHandle<()>,
}

type Registry = Arc<Mutex<HashMap<String, RunningJob>>>;

fn lock(registry: &Mutex<HashMap<String, RunningJob>>) -> MutexGuard<'_, HashMap<String, RunningJob>> {
    registry.lock().unwrap_or_else(|poisoned| {
        warn!("WorkerPool registry lock poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Removes the task's registry entry however the task ends.
struct RunGuard {
    registry: Registry,
    idle: Arc<Notify>,
    job_id: String,
    run_id: u64,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut running = lock(&self.registry);
        if running.get(&self.job_id).map(|r| r.run_id) == Some(self.run_id) {
            running.remove(&self.job_id);
        }
        drop(running);
        self.idle.notify_waiters();
    }
}

pub struct WorkerPool {
    pipeline: Arc<Pipeline>,
    store: JobStore,
    progress: Option<JobProgressBroadcaster>,
    results: Option<mpsc::UnboundedSender<JobResult>>,
    running: Registry,
    idle: Arc<Notify>,
    next_run: AtomicU64,
    shutdown: AtomicBool,
}

impl WorkerPool {
    pub fn new(pipeline: Arc<Pipeline>, store: JobStore) -> Self {
        Self {
            pipeline,
            store,
            progress: None,
            results: None,
            running: Arc::new(Mutex::new(HashMap::new())),
            idle: Arc::new(Notify::new()),
            next_run: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Publishes progress of every run on `broadcaster`.
    pub fn with_progress(mut self, broadcaster: JobProgressBroadcaster) -> Self {
        self.progress = Some(broadcaster);
        self
    }

    /// Sends the outcome of every finished run to `sender`.
    pub fn with_result_sender(mut self, sender: mpsc::UnboundedSender<JobResult>) -> Self {
        self.results = Some(sender);
        self
    }

    /// Starts a run. Fails if a run for the same job is still alive.
    pub fn submit(&self, request: JobRequest) -> Result<(), WorkerError> {
        self.spawn(request, false)
    }

    /// Starts a run, aborting any live run for the same job first.
    ///
    /// Units are written at most once per index, so an aborted run can never
    /// clobber what the new run produces.
    pub fn restart(&self, request: JobRequest) -> Result<(), WorkerError> {
        self.spawn(request, true)
    }

    fn spawn(&self, request: JobRequest, replace: bool) -> Result<(), WorkerError> {
        if self.is_shutdown() {
            return Err(WorkerError::ShuttingDown);
        }

        let mut running = lock(&self.running);
        if let Some(existing) = running.get(&request.job_id) {
            if !existing.handle.is_finished() {
                if !replace {
                    return Err(WorkerError::AlreadyRunning(request.job_id));
                }
                info!("Aborting stale run of job {}", request.job_id);
                existing.handle.abort();
            }
        }

        let run_id = self.next_run.fetch_add(1, Ordering::Relaxed);
        let guard = RunGuard {
            registry: Arc::clone(&self.running),
            idle: Arc::clone(&self.idle),
            job_id: request.job_id.clone(),
            run_id,
        };
        let pipeline = Arc::clone(&self.pipeline);
        let store = self.store.clone();
        let broadcaster = self.progress.clone();
        let results = self.results.clone();
        let job_id = request.job_id.clone();

        let handle = tokio::spawn(async move {
            let _guard = guard;
            debug!("Run {} of job {} started", run_id, request.job_id);

            let reporter: Box<dyn ProgressReporter> = match (&broadcaster, store.get(&request.job_id)) {
                (Some(broadcaster), Ok(Some(job))) => Box::new(BroadcastProgress::new(broadcaster, &job)),
                _ => Box::new(NoopProgress),
            };

            let outcome = pipeline
                .run(&request.job_id, request.strategy, reporter.as_ref())
                .await;
            debug!("Run {} of job {} ended: {:?}", run_id, request.job_id, outcome);

            if let Some(results) = results {
                let _ = results.send(JobResult {
                    job_id: request.job_id,
                    outcome,
                });
            }
        });

        running.insert(job_id, RunningJob { run_id, handle });
        Ok(())
    }

    /// Aborts the live run of `job_id`, if any.
    pub fn abort(&self, job_id: &str) -> bool {
        match lock(&self.running).get(job_id) {
            Some(run) if !run.handle.is_finished() => {
                run.handle.abort();
                true
            }
            _ => false,
        }
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        lock(&self.running)
            .get(job_id)
            .is_some_and(|r| !r.handle.is_finished())
    }

    pub fn running_count(&self) -> usize {
        lock(&self.running).len()
    }

    /// Resolves once no run is registered.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.running_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Stops accepting runs, waits up to `grace` for live runs, then aborts
    /// the rest. Aborted jobs stay resumable from their checkpoints.
    pub async fn shutdown_and_wait(&self, grace: Duration) {
        self.shutdown();
        if tokio::time::timeout(grace, self.wait_idle()).await.is_err() {
            let running = lock(&self.running);
            warn!(
                "{} run(s) still active after {:?}, aborting",
                running.len(),
                grace
            );
            for run in running.values() {
                run.handle.abort();
            }
        }
        info!("Worker pool stopped");
    }
}
