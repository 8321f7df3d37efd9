//! Unit repository: idempotent checkpoint writes for generated units.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A raw unit row from the database.
#[derive(Debug, Clone)]
pub struct UnitRow {
    pub job_id: String,
    pub unit_index: i64,
    pub title: String,
    pub kind: String,
    pub content: String,
    pub size: i64,
    pub is_fallback: bool,
    pub created_at: String,
}

impl UnitRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            job_id: row.get("job_id")?,
            unit_index: row.get("unit_index")?,
            title: row.get("title")?,
            kind: row.get("kind")?,
            content: row.get("content")?,
            size: row.get("size")?,
            is_fallback: row.get::<_, i64>("is_fallback")? != 0,
            created_at: row.get("created_at")?,
        })
    }
}

/// Inserts a unit unless one already exists for `(job_id, unit_index)`.
///
/// The job's `completed_units` is recomputed from the table in the same
/// transaction, so it always equals the number of persisted units. A job
/// that is already completed is frozen: nothing is written for it.
/// Returns `true` if the row was newly written.
pub fn insert_if_absent(db: &Database, unit: &UnitRow) -> Result<bool, DatabaseError> {
    db.write(|tx| {
        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM jobs WHERE id = ?1",
                params![unit.job_id],
                |r| r.get(0),
            )
            .optional()?;
        if status.as_deref() == Some("completed") {
            return Ok(false);
        }

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO units (job_id, unit_index, title, kind, content, size,
             is_fallback, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                unit.job_id,
                unit.unit_index,
                unit.title,
                unit.kind,
                unit.content,
                unit.size,
                unit.is_fallback as i64,
                unit.created_at,
            ],
        )?;
        tx.execute(
            "UPDATE jobs SET completed_units =
               (SELECT COUNT(*) FROM units WHERE job_id = ?1),
             updated_at = ?2
             WHERE id = ?1",
            params![unit.job_id, unit.created_at],
        )?;
        Ok(inserted == 1)
    })
}

/// Lists all units for a job, ordered by index.
pub fn list_for_job(db: &Database, job_id: &str) -> Result<Vec<UnitRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM units WHERE job_id = ?1 ORDER BY unit_index ASC")?;
        let rows = stmt
            .query_map(params![job_id], UnitRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Returns the indices already persisted for a job, ascending.
pub fn indices_for_job(db: &Database, job_id: &str) -> Result<Vec<i64>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT unit_index FROM units WHERE job_id = ?1 ORDER BY unit_index ASC")?;
        let rows = stmt
            .query_map(params![job_id], |r| r.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Counts persisted units for a job.
pub fn count_for_job(db: &Database, job_id: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM units WHERE job_id = ?1",
            params![job_id],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    })
}
