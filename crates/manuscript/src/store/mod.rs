//! Typed job store over the SQLite repositories.
//!
//! `JobStore` is the single source of truth for job state. Everything the
//! pipeline and the recovery operations know about a job is read from here,
//! and every write is either compare-and-set on status or keyed append.

pub mod models;

use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::db::artifact_repo::{self, ArtifactRow};
use crate::db::job_repo::{self, AdmitLimits, AdmitOutcome, JobFilter, JobRow};
use crate::db::unit_repo::{self, UnitRow};
use crate::db::{usage_repo, Database, DatabaseError};

pub use models::{
    status_strs, word_count, Artifact, GenerationInput, GenerationJob, JobStatus, ModeFlags,
    Outline, OutlineUnit, Unit, UnitKind,
};

// ─── Helpers ────────────────────────────────────────────────────────────────

pub(crate) fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            log::warn!("parse_timestamp: failed to parse '{}': {}", s, e);
            Utc::now()
        })
}

fn parse_status(s: &str, job_id: &str) -> JobStatus {
    s.parse().unwrap_or_else(|_| {
        log::warn!(
            "Unknown job status '{}' for job {}, treating as failed",
            s,
            job_id
        );
        JobStatus::Failed
    })
}

fn job_from_row(row: JobRow) -> Result<GenerationJob, DatabaseError> {
    let input: GenerationInput =
        serde_json::from_str(&row.input).map_err(|e| DatabaseError::Json {
            column: "input",
            source: e,
        })?;
    let outline = match row.outline.as_deref() {
        Some(raw) => Some(
            serde_json::from_str::<Outline>(raw).map_err(|e| DatabaseError::Json {
                column: "outline",
                source: e,
            })?,
        ),
        None => None,
    };

    Ok(GenerationJob {
        status: parse_status(&row.status, &row.id),
        progress_percent: row.progress_percent.clamp(0, 100) as u8,
        total_units: row.total_units.max(0) as usize,
        completed_units: row.completed_units.max(0) as usize,
        created_at: parse_timestamp(&row.created_at),
        updated_at: parse_timestamp(&row.updated_at),
        completed_at: row.completed_at.as_deref().map(parse_timestamp),
        id: row.id,
        owner_id: row.owner_id,
        input,
        model_selector: row.model_selector,
        error_message: row.error_message,
        message: row.message,
        outline,
        artifact_ref: row.artifact_ref,
    })
}

fn unit_from_row(row: UnitRow) -> Unit {
    Unit {
        index: row.unit_index.max(0) as usize,
        kind: UnitKind::parse_lenient(&row.kind),
        created_at: parse_timestamp(&row.created_at),
        size: row.size.max(0) as usize,
        job_id: row.job_id,
        title: row.title,
        content: row.content,
        is_fallback: row.is_fallback,
    }
}

/// Outcome of [`JobStore::create_admitted_job`].
#[derive(Debug)]
pub enum Admission {
    Created(GenerationJob),
    /// Active job count at the time of the attempt.
    TooManyActive(u64),
    /// Submissions already counted today.
    QuotaReached(u64),
}

// ─── JobStore ───────────────────────────────────────────────────────────────

/// Durable job, unit and artifact storage.
#[derive(Clone)]
pub struct JobStore {
    db: Database,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn pending_row(
        owner_id: &str,
        input: &GenerationInput,
        model_selector: &str,
    ) -> Result<JobRow, DatabaseError> {
        let now = format_timestamp(Utc::now());
        let input_json = serde_json::to_string(input).map_err(|e| DatabaseError::Json {
            column: "input",
            source: e,
        })?;
        Ok(JobRow {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            input: input_json,
            model_selector: model_selector.to_string(),
            status: JobStatus::Pending.as_str().to_string(),
            progress_percent: 0,
            total_units: 0,
            completed_units: 0,
            error_message: None,
            message: Some("Queued".to_string()),
            outline: None,
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
            artifact_ref: None,
        })
    }

    /// Creates a pending job.
    pub fn create_job(
        &self,
        owner_id: &str,
        input: &GenerationInput,
        model_selector: &str,
    ) -> Result<GenerationJob, DatabaseError> {
        let row = Self::pending_row(owner_id, input, model_selector)?;
        job_repo::insert(&self.db, &row)?;
        job_from_row(row)
    }

    /// Creates a pending job and counts it against today's quota, unless the
    /// owner has `max_active` non-terminal jobs or used up `daily_quota`.
    pub fn create_admitted_job(
        &self,
        owner_id: &str,
        input: &GenerationInput,
        model_selector: &str,
        max_active: u64,
        daily_quota: u64,
    ) -> Result<Admission, DatabaseError> {
        let row = Self::pending_row(owner_id, input, model_selector)?;
        let day = today();
        let inactive = status_strs(&JobStatus::TERMINAL);
        let limits = AdmitLimits {
            max_active,
            daily_quota,
            day: &day,
            inactive: &inactive,
        };
        Ok(match job_repo::insert_admitted(&self.db, &row, limits)? {
            AdmitOutcome::Inserted => Admission::Created(job_from_row(row)?),
            AdmitOutcome::TooManyActive(active) => Admission::TooManyActive(active),
            AdmitOutcome::QuotaReached(used) => Admission::QuotaReached(used),
        })
    }

    pub fn get(&self, job_id: &str) -> Result<Option<GenerationJob>, DatabaseError> {
        job_repo::find_by_id(&self.db, job_id)?
            .map(job_from_row)
            .transpose()
    }

    /// Lists jobs newest first, returning the page and the total match count.
    pub fn list(
        &self,
        owner_id: Option<&str>,
        statuses: &[JobStatus],
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<(Vec<GenerationJob>, u64), DatabaseError> {
        let filter = JobFilter {
            owner_id: owner_id.map(str::to_string),
            statuses: statuses.iter().map(|s| s.as_str().to_string()).collect(),
            limit,
            offset,
        };
        let (rows, total) = job_repo::query(&self.db, &filter)?;
        let jobs = rows
            .into_iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((jobs, total))
    }

    /// Counts the owner's non-terminal jobs.
    pub fn count_active(&self, owner_id: &str) -> Result<u64, DatabaseError> {
        job_repo::count_for_owner_excluding(
            &self.db,
            owner_id,
            &status_strs(&JobStatus::TERMINAL),
        )
    }

    /// Compare-and-set status change. Returns `false` if the job was not in `from`.
    pub fn transition(
        &self,
        job_id: &str,
        from: &[JobStatus],
        to: JobStatus,
        message: &str,
    ) -> Result<bool, DatabaseError> {
        job_repo::transition_status(
            &self.db,
            job_id,
            &status_strs(from),
            to.as_str(),
            message,
            &format_timestamp(Utc::now()),
        )
    }

    /// Marks the job failed if it is still in one of `from`.
    pub fn fail(
        &self,
        job_id: &str,
        from: &[JobStatus],
        error_message: &str,
    ) -> Result<bool, DatabaseError> {
        job_repo::fail(
            &self.db,
            job_id,
            &status_strs(from),
            error_message,
            &format_timestamp(Utc::now()),
        )
    }

    /// Marks the job completed with its artifact if it is still in one of `from`.
    pub fn complete(&self, job_id: &str, from: &[JobStatus]) -> Result<bool, DatabaseError> {
        job_repo::complete(
            &self.db,
            job_id,
            &status_strs(from),
            job_id,
            &format_timestamp(Utc::now()),
        )
    }

    pub fn set_outline(&self, job_id: &str, outline: &Outline) -> Result<(), DatabaseError> {
        let json = serde_json::to_string(outline).map_err(|e| DatabaseError::Json {
            column: "outline",
            source: e,
        })?;
        job_repo::set_outline(
            &self.db,
            job_id,
            &json,
            outline.total_units() as i64,
            &format_timestamp(Utc::now()),
        )
    }

    /// Raises progress monotonically and records the phase message.
    pub fn raise_progress(
        &self,
        job_id: &str,
        percent: u8,
        message: &str,
    ) -> Result<(), DatabaseError> {
        job_repo::raise_progress(
            &self.db,
            job_id,
            i64::from(percent.min(100)),
            message,
            &format_timestamp(Utc::now()),
        )
    }

    /// Persists a unit unless its index already exists. Returns `true` if written.
    pub fn insert_unit(&self, unit: &Unit) -> Result<bool, DatabaseError> {
        let row = UnitRow {
            job_id: unit.job_id.clone(),
            unit_index: unit.index as i64,
            title: unit.title.clone(),
            kind: unit.kind.as_str().to_string(),
            content: unit.content.clone(),
            size: unit.size as i64,
            is_fallback: unit.is_fallback,
            created_at: format_timestamp(unit.created_at),
        };
        unit_repo::insert_if_absent(&self.db, &row)
    }

    /// Units of a job in index order.
    pub fn units(&self, job_id: &str) -> Result<Vec<Unit>, DatabaseError> {
        Ok(unit_repo::list_for_job(&self.db, job_id)?
            .into_iter()
            .map(unit_from_row)
            .collect())
    }

    pub fn unit_indices(&self, job_id: &str) -> Result<BTreeSet<usize>, DatabaseError> {
        Ok(unit_repo::indices_for_job(&self.db, job_id)?
            .into_iter()
            .map(|i| i.max(0) as usize)
            .collect())
    }

    pub fn unit_count(&self, job_id: &str) -> Result<usize, DatabaseError> {
        Ok(unit_repo::count_for_job(&self.db, job_id)? as usize)
    }

    /// Stores the job's artifact. Returns `false` if one already existed.
    pub fn insert_artifact(&self, artifact: &Artifact) -> Result<bool, DatabaseError> {
        artifact_repo::insert_if_absent(
            &self.db,
            &ArtifactRow {
                job_id: artifact.job_id.clone(),
                content: artifact.content.clone(),
                is_partial: artifact.is_partial,
                created_at: format_timestamp(artifact.created_at),
            },
        )
    }

    pub fn artifact(&self, job_id: &str) -> Result<Option<Artifact>, DatabaseError> {
        Ok(artifact_repo::find_by_job(&self.db, job_id)?.map(|row| Artifact {
            created_at: parse_timestamp(&row.created_at),
            job_id: row.job_id,
            content: row.content,
            is_partial: row.is_partial,
        }))
    }

    /// Submissions the owner made on the current UTC day.
    pub fn submissions_today(&self, owner_id: &str) -> Result<u64, DatabaseError> {
        usage_repo::submissions_on(&self.db, owner_id, &today())
    }

    /// Deletes a job together with its units and artifact.
    pub fn delete(&self, job_id: &str) -> Result<bool, DatabaseError> {
        job_repo::delete(&self.db, job_id)
    }
}

fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}
