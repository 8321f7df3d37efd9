//! Batch unit scheduler.
//!
//! Missing units are generated a batch at a time. Every unit of a batch runs
//! concurrently and is persisted the moment it resolves; the next batch only
//! starts once the whole batch has resolved. The stored job status is read
//! before each batch so a cancel (or any other outside transition) stops the
//! run between batches.

use std::collections::BTreeSet;

use chrono::Utc;
use futures_util::future::join_all;
use tracing::{info_span, Instrument};

use super::error::PipelineError;
use super::progress::{ProgressEvent, ProgressReporter};
use super::unit_progress;
use crate::db::DatabaseError;
use crate::executor::Executor;
use crate::planner::{build_unit_prompt, fallback_placeholder, UNIT_SYSTEM_PROMPT};
use crate::provider::ModelRoute;
use crate::store::{word_count, GenerationJob, JobStatus, JobStore, Outline, OutlineUnit, Unit};

/// Splits the outline's unpersisted indices into batches of `batch_size`, in index order.
pub fn partition(outline: &Outline, persisted: &BTreeSet<usize>, batch_size: usize) -> Vec<Vec<usize>> {
    let pending: Vec<usize> = outline
        .units
        .iter()
        .map(|u| u.index)
        .filter(|i| !persisted.contains(i))
        .collect();
    pending
        .chunks(batch_size.max(1))
        .map(<[usize]>::to_vec)
        .collect()
}

/// How a scheduling run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Every planned unit is persisted.
    Finished,
    /// The job left `generating_units` between batches.
    Stopped(JobStatus),
}

#[derive(Clone)]
pub struct BatchScheduler {
    store: JobStore,
    executor: Executor,
    batch_size: usize,
}

impl BatchScheduler {
    pub fn new(store: JobStore, executor: Executor, batch_size: usize) -> Self {
        Self {
            store,
            executor,
            batch_size: batch_size.max(1),
        }
    }

    /// Generates every unit of `outline` not yet stored for `job`.
    pub async fn run(
        &self,
        job: &GenerationJob,
        outline: &Outline,
        route: &ModelRoute,
        progress: &dyn ProgressReporter,
    ) -> Result<ScheduleOutcome, PipelineError> {
        let persisted = self.store.unit_indices(&job.id)?;
        let batches = partition(outline, &persisted, self.batch_size);
        let total = outline.total_units();

        log::info!(
            "Job {}: {} of {} units stored, {} batch(es) to run",
            job.id,
            persisted.len(),
            total,
            batches.len()
        );

        for (number, batch) in batches.iter().enumerate() {
            let status = self
                .store
                .get(&job.id)?
                .map(|j| j.status)
                .ok_or_else(|| PipelineError::NotFound(job.id.clone()))?;
            if status != JobStatus::GeneratingUnits {
                log::info!(
                    "Job {} is {} before batch {}, stopping",
                    job.id,
                    status,
                    number + 1
                );
                return Ok(ScheduleOutcome::Stopped(status));
            }

            let span = info_span!("batch", job_id = %job.id, batch = number + 1, size = batch.len());
            self.run_batch(job, outline, route, batch)
                .instrument(span)
                .await?;

            let completed = self.store.unit_count(&job.id)?;
            let percent = unit_progress(completed, total);
            self.store.raise_progress(
                &job.id,
                percent,
                &format!("Generated {} of {} units", completed, total),
            )?;
            progress.report(ProgressEvent::Units {
                percent,
                completed_units: completed,
                total_units: total,
            });
        }

        Ok(ScheduleOutcome::Finished)
    }

    async fn run_batch(
        &self,
        job: &GenerationJob,
        outline: &Outline,
        route: &ModelRoute,
        batch: &[usize],
    ) -> Result<(), DatabaseError> {
        let tasks = batch
            .iter()
            .filter_map(|index| outline.units.get(*index))
            .map(|unit| self.generate_unit(job, outline, unit, route));

        // Barrier: every unit resolves before any error is surfaced.
        let results = join_all(tasks).await;
        let mut fallbacks = 0usize;
        for result in results {
            if result? {
                fallbacks += 1;
            }
        }
        if fallbacks > 0 {
            log::warn!(
                "Job {}: {} unit(s) of this batch stored as fallback placeholders",
                job.id,
                fallbacks
            );
        }
        Ok(())
    }

    /// Generates and persists one unit. Returns `true` if a fallback was stored.
    async fn generate_unit(
        &self,
        job: &GenerationJob,
        outline: &Outline,
        unit: &OutlineUnit,
        route: &ModelRoute,
    ) -> Result<bool, DatabaseError> {
        let prompt = build_unit_prompt(&job.input, outline, unit);
        let (content, is_fallback) = match self
            .executor
            .execute(route, Some(UNIT_SYSTEM_PROMPT), &prompt)
            .await
        {
            Ok(execution) => (execution.text.trim().to_string(), false),
            Err(e) => {
                tracing::warn!(
                    job_id = %job.id,
                    unit = unit.index,
                    attempts = e.attempts,
                    "unit generation exhausted, storing placeholder: {}",
                    e.message
                );
                (fallback_placeholder(unit), true)
            }
        };

        let record = Unit {
            job_id: job.id.clone(),
            index: unit.index,
            title: unit.title.clone(),
            kind: unit.kind,
            size: word_count(&content),
            content,
            is_fallback,
            created_at: Utc::now(),
        };
        if !self.store.insert_unit(&record)? {
            log::debug!(
                "Unit {} of job {} was already stored, keeping the existing one",
                unit.index,
                job.id
            );
        }
        Ok(is_fallback)
    }
}
