//! Concatenates persisted units into a document.

use chrono::Utc;
use thiserror::Error;

use crate::db::DatabaseError;
use crate::store::{Artifact, GenerationJob, JobStore, Unit};

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Job {0} has no generated units yet")]
    NoContent(String),

    #[error("Job {job_id} has {have} of {expected} units; cannot assemble a complete document")]
    Incomplete {
        job_id: String,
        have: usize,
        expected: usize,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Renders the document body: the title heading, then each unit in index order.
pub fn render(title: &str, units: &[Unit]) -> String {
    let mut out = format!("# {}\n", title.trim());
    for unit in units {
        out.push_str(&format!("\n## {}\n\n{}\n", unit.title.trim(), unit.content.trim()));
    }
    out
}

/// Assembles the job's units.
///
/// With `partial = false` every planned unit must exist and the artifact is
/// stored; a second call returns the stored artifact. With `partial = true`
/// whatever exists is rendered and nothing is written.
pub fn assemble(store: &JobStore, job_id: &str, partial: bool) -> Result<Artifact, AssemblyError> {
    let job = store
        .get(job_id)?
        .ok_or_else(|| AssemblyError::NotFound(job_id.to_string()))?;
    let units = store.units(job_id)?;
    if units.is_empty() {
        return Err(AssemblyError::NoContent(job_id.to_string()));
    }

    if partial {
        return Ok(build(&job, &units, true));
    }

    if units.len() < job.total_units {
        return Err(AssemblyError::Incomplete {
            job_id: job_id.to_string(),
            have: units.len(),
            expected: job.total_units,
        });
    }

    let artifact = build(&job, &units, false);
    if !store.insert_artifact(&artifact)? {
        log::debug!("Artifact for job {} already stored, reusing it", job_id);
        if let Some(existing) = store.artifact(job_id)? {
            return Ok(existing);
        }
    }
    Ok(artifact)
}

fn build(job: &GenerationJob, units: &[Unit], is_partial: bool) -> Artifact {
    Artifact {
        job_id: job.id.clone(),
        content: render(&job.document_title(), units),
        is_partial,
        created_at: Utc::now(),
    }
}
