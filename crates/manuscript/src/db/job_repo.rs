//! Job repository: CRUD and compare-and-set operations for the `jobs` table.

use rusqlite::types::ToSql;
use rusqlite::{params, Connection, Row};

use super::{usage_repo, Database, DatabaseError};

/// A raw job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub owner_id: String,
    /// JSON-encoded generation input.
    pub input: String,
    pub model_selector: String,
    pub status: String,
    pub progress_percent: i64,
    pub total_units: i64,
    pub completed_units: i64,
    pub error_message: Option<String>,
    pub message: Option<String>,
    /// JSON-encoded outline, present once planning succeeded.
    pub outline: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    pub artifact_ref: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            owner_id: row.get("owner_id")?,
            input: row.get("input")?,
            model_selector: row.get("model_selector")?,
            status: row.get("status")?,
            progress_percent: row.get("progress_percent")?,
            total_units: row.get("total_units")?,
            completed_units: row.get("completed_units")?,
            error_message: row.get("error_message")?,
            message: row.get("message")?,
            outline: row.get("outline")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            completed_at: row.get("completed_at")?,
            artifact_ref: row.get("artifact_ref")?,
        })
    }
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub owner_id: Option<String>,
    pub statuses: Vec<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Builds `?a, ?b, ...` placeholders starting after `offset` bound parameters.
fn placeholders(offset: usize, count: usize) -> String {
    (offset + 1..=offset + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_row(conn: &Connection, job: &JobRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO jobs (id, owner_id, input, model_selector, status, progress_percent,
         total_units, completed_units, error_message, message, outline, created_at,
         updated_at, completed_at, artifact_ref)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            job.id,
            job.owner_id,
            job.input,
            job.model_selector,
            job.status,
            job.progress_percent,
            job.total_units,
            job.completed_units,
            job.error_message,
            job.message,
            job.outline,
            job.created_at,
            job.updated_at,
            job.completed_at,
            job.artifact_ref,
        ],
    )?;
    Ok(())
}

/// Inserts a new job row.
pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| insert_row(conn, job))
}

/// Limits checked by [`insert_admitted`].
#[derive(Debug, Clone, Copy)]
pub struct AdmitLimits<'a> {
    pub max_active: u64,
    pub daily_quota: u64,
    /// UTC day the submission counts against, `YYYY-MM-DD`.
    pub day: &'a str,
    /// Statuses that do not count as active.
    pub inactive: &'a [&'a str],
}

/// Result of [`insert_admitted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    Inserted,
    TooManyActive(u64),
    QuotaReached(u64),
}

/// Inserts `job` and counts it against the owner's daily quota, but only
/// while the owner is under both limits. The checks and the writes share
/// one transaction, so concurrent submissions cannot overshoot.
pub fn insert_admitted(
    db: &Database,
    job: &JobRow,
    limits: AdmitLimits<'_>,
) -> Result<AdmitOutcome, DatabaseError> {
    db.write(|tx| {
        let active = count_excluding(tx, &job.owner_id, limits.inactive)?;
        if active >= limits.max_active {
            return Ok(AdmitOutcome::TooManyActive(active));
        }
        let today = usage_repo::count(tx, &job.owner_id, limits.day)?;
        if today >= limits.daily_quota {
            return Ok(AdmitOutcome::QuotaReached(today));
        }
        insert_row(tx, job)?;
        usage_repo::bump(tx, &job.owner_id, limits.day)?;
        Ok(AdmitOutcome::Inserted)
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], JobRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Queries jobs with filters, returning (rows, total_count).
pub fn query(db: &Database, filter: &JobFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(ref owner_id) = filter.owner_id {
            conditions.push(format!("owner_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(owner_id.clone()));
        }
        if !filter.statuses.is_empty() {
            conditions.push(format!(
                "status IN ({})",
                placeholders(param_values.len(), filter.statuses.len())
            ));
            for status in &filter.statuses {
                param_values.push(Box::new(status.clone()));
            }
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let params_ref: Vec<&dyn ToSql> = param_values.iter().map(|p| p.as_ref()).collect();
        let total: i64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT * FROM jobs {} ORDER BY created_at DESC, id ASC LIMIT ?{} OFFSET ?{}",
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn ToSql> = param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<JobRow> = stmt
            .query_map(params_ref.as_slice(), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total as u64))
    })
}

fn count_excluding(
    conn: &Connection,
    owner_id: &str,
    excluded: &[&str],
) -> Result<u64, DatabaseError> {
    let sql = format!(
        "SELECT COUNT(*) FROM jobs WHERE owner_id = ?1 AND status NOT IN ({})",
        placeholders(1, excluded.len())
    );
    let mut values: Vec<&dyn ToSql> = vec![&owner_id];
    values.extend(excluded.iter().map(|s| s as &dyn ToSql));
    let count: i64 = conn.query_row(&sql, values.as_slice(), |r| r.get(0))?;
    Ok(count as u64)
}

/// Counts an owner's jobs whose status is not in `excluded`.
pub fn count_for_owner_excluding(
    db: &Database,
    owner_id: &str,
    excluded: &[&str],
) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| count_excluding(conn, owner_id, excluded))
}

/// Moves a job to `to` only if its current status is one of `from`.
///
/// Returns `true` when the row was updated. `message` replaces the phase
/// message; `error_message` is cleared unless the target is a failure.
pub fn transition_status(
    db: &Database,
    id: &str,
    from: &[&str],
    to: &str,
    message: &str,
    updated_at: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let sql = format!(
            "UPDATE jobs SET status = ?2, message = ?3, updated_at = ?4,
             error_message = CASE WHEN ?2 = 'failed' THEN error_message ELSE NULL END
             WHERE id = ?1 AND status IN ({})",
            placeholders(4, from.len())
        );
        let mut values: Vec<&dyn ToSql> = vec![&id, &to, &message, &updated_at];
        values.extend(from.iter().map(|s| s as &dyn ToSql));
        let changed = conn.execute(&sql, values.as_slice())?;
        Ok(changed == 1)
    })
}

/// Marks a job failed with an error message if its status is one of `from`.
pub fn fail(
    db: &Database,
    id: &str,
    from: &[&str],
    error_message: &str,
    updated_at: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let sql = format!(
            "UPDATE jobs SET status = 'failed', error_message = ?2, message = 'Failed',
             updated_at = ?3 WHERE id = ?1 AND status IN ({})",
            placeholders(3, from.len())
        );
        let mut values: Vec<&dyn ToSql> = vec![&id, &error_message, &updated_at];
        values.extend(from.iter().map(|s| s as &dyn ToSql));
        let changed = conn.execute(&sql, values.as_slice())?;
        Ok(changed == 1)
    })
}

/// Marks a job completed and links its artifact if its status is one of `from`.
pub fn complete(
    db: &Database,
    id: &str,
    from: &[&str],
    artifact_ref: &str,
    completed_at: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let sql = format!(
            "UPDATE jobs SET status = 'completed', progress_percent = 100,
             artifact_ref = ?2, completed_at = ?3, updated_at = ?3, message = 'Completed',
             error_message = NULL
             WHERE id = ?1 AND status IN ({})",
            placeholders(3, from.len())
        );
        let mut values: Vec<&dyn ToSql> = vec![&id, &artifact_ref, &completed_at];
        values.extend(from.iter().map(|s| s as &dyn ToSql));
        let changed = conn.execute(&sql, values.as_slice())?;
        Ok(changed == 1)
    })
}

/// Stores the planned outline and the unit total.
pub fn set_outline(
    db: &Database,
    id: &str,
    outline_json: &str,
    total_units: i64,
    updated_at: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET outline = ?2, total_units = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, outline_json, total_units, updated_at],
        )?;
        Ok(())
    })
}

/// Raises `progress_percent`; never lowers it. Terminal jobs are left alone.
pub fn raise_progress(
    db: &Database,
    id: &str,
    percent: i64,
    message: &str,
    updated_at: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET progress_percent = MAX(progress_percent, ?2), message = ?3,
             updated_at = ?4
             WHERE id = ?1 AND status NOT IN ('completed', 'failed', 'cancelled')",
            params![id, percent, message, updated_at],
        )?;
        Ok(())
    })
}

/// Deletes a job row. Units and artifact rows cascade.
pub fn delete(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        Ok(changed == 1)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn sample_job(id: &str) -> JobRow {
        JobRow {
            id: id.to_string(),
            owner_id: "alice".to_string(),
            input: "{}".to_string(),
            model_selector: "default".to_string(),
            status: "pending".to_string(),
            progress_percent: 0,
            total_units: 0,
            completed_units: 0,
            error_message: None,
            message: Some("Queued".to_string()),
            outline: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
            completed_at: None,
            artifact_ref: None,
        }
    }

    #[test]
    fn test_insert_and_find() {
        let db = test_db();
        insert(&db, &sample_job("job-1")).unwrap();

        let found = find_by_id(&db, "job-1").unwrap().unwrap();
        assert_eq!(found.owner_id, "alice");
        assert_eq!(found.status, "pending");
        assert!(found.outline.is_none());
    }

    #[test]
    fn test_find_nonexistent() {
        let db = test_db();
        assert!(find_by_id(&db, "nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_query_filters_owner_and_status() {
        let db = test_db();
        insert(&db, &sample_job("a1")).unwrap();
        let mut other = sample_job("b1");
        other.owner_id = "bob".to_string();
        insert(&db, &other).unwrap();
        let mut done = sample_job("a2");
        done.status = "completed".to_string();
        insert(&db, &done).unwrap();

        let (rows, total) = query(
            &db,
            &JobFilter {
                owner_id: Some("alice".to_string()),
                statuses: vec!["pending".to_string(), "planning".to_string()],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].id, "a1");
    }

    #[test]
    fn test_query_pagination() {
        let db = test_db();
        for i in 0..10 {
            let mut job = sample_job(&format!("p{}", i));
            job.created_at = format!("2026-01-{:02}T00:00:00Z", i + 1);
            insert(&db, &job).unwrap();
        }

        let (rows, total) = query(
            &db,
            &JobFilter {
                limit: Some(3),
                offset: Some(0),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(total, 10);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].id, "p9");
    }

    #[test]
    fn test_count_for_owner_excluding() {
        let db = test_db();
        insert(&db, &sample_job("c1")).unwrap();
        let mut failed = sample_job("c2");
        failed.status = "failed".to_string();
        insert(&db, &failed).unwrap();

        let active =
            count_for_owner_excluding(&db, "alice", &["completed", "failed", "cancelled"])
                .unwrap();
        assert_eq!(active, 1);
        assert_eq!(
            count_for_owner_excluding(&db, "bob", &["completed"]).unwrap(),
            0
        );
    }

    const INACTIVE: [&str; 3] = ["completed", "failed", "cancelled"];

    fn limits(max_active: u64, daily_quota: u64) -> AdmitLimits<'static> {
        AdmitLimits {
            max_active,
            daily_quota,
            day: "2026-01-01",
            inactive: &INACTIVE,
        }
    }

    #[test]
    fn test_insert_admitted_counts_only_active_jobs() {
        let db = test_db();
        let mut done = sample_job("l0");
        done.status = "failed".to_string();
        insert(&db, &done).unwrap();

        let admit = |id: &str, limits| insert_admitted(&db, &sample_job(id), limits).unwrap();
        assert_eq!(admit("l1", limits(2, 10)), AdmitOutcome::Inserted);
        assert_eq!(admit("l2", limits(2, 10)), AdmitOutcome::Inserted);
        assert_eq!(admit("l3", limits(2, 10)), AdmitOutcome::TooManyActive(2));
        assert!(find_by_id(&db, "l3").unwrap().is_none());
        assert_eq!(admit("l4", limits(0, 10)), AdmitOutcome::TooManyActive(2));

        let mut other_owner = sample_job("l5");
        other_owner.owner_id = "bob".to_string();
        assert_eq!(
            insert_admitted(&db, &other_owner, limits(2, 10)).unwrap(),
            AdmitOutcome::Inserted
        );
    }

    #[test]
    fn test_insert_admitted_enforces_daily_quota() {
        let db = test_db();
        let admit = |id: &str| insert_admitted(&db, &sample_job(id), limits(10, 2)).unwrap();
        assert_eq!(admit("q1"), AdmitOutcome::Inserted);
        assert_eq!(admit("q2"), AdmitOutcome::Inserted);
        assert_eq!(admit("q3"), AdmitOutcome::QuotaReached(2));

        // Rejected submissions are not counted.
        assert_eq!(usage_repo::submissions_on(&db, "alice", "2026-01-01").unwrap(), 2);
        assert_eq!(usage_repo::submissions_on(&db, "alice", "2026-01-02").unwrap(), 0);
    }

    #[test]
    fn test_insert_admitted_holds_across_threads() {
        let db = test_db();
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let db = db.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    insert_admitted(&db, &sample_job(&format!("race-{}", i)), limits(3, 100))
                        .unwrap()
                })
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|outcome| *outcome == AdmitOutcome::Inserted)
            .count();

        assert_eq!(admitted, 3);
        assert_eq!(count_for_owner_excluding(&db, "alice", &INACTIVE).unwrap(), 3);
        assert_eq!(usage_repo::submissions_on(&db, "alice", "2026-01-01").unwrap(), 3);
    }

    #[test]
    fn test_transition_is_compare_and_set() {
        let db = test_db();
        insert(&db, &sample_job("t1")).unwrap();

        let moved =
            transition_status(&db, "t1", &["pending"], "planning", "Planning", "2026-01-01T00:01:00Z")
                .unwrap();
        assert!(moved);

        // Second transition from the stale state must not apply.
        let moved_again =
            transition_status(&db, "t1", &["pending"], "cancelled", "x", "2026-01-01T00:02:00Z")
                .unwrap();
        assert!(!moved_again);
        assert_eq!(find_by_id(&db, "t1").unwrap().unwrap().status, "planning");
    }

    #[test]
    fn test_fail_and_complete() {
        let db = test_db();
        insert(&db, &sample_job("f1")).unwrap();
        assert!(fail(&db, "f1", &["pending"], "boom", "2026-01-01T00:01:00Z").unwrap());
        let row = find_by_id(&db, "f1").unwrap().unwrap();
        assert_eq!(row.status, "failed");
        assert_eq!(row.error_message.as_deref(), Some("boom"));

        // Completing requires the listed source state.
        assert!(!complete(&db, "f1", &["assembling"], "f1", "2026-01-01T00:02:00Z").unwrap());
        assert!(complete(&db, "f1", &["failed"], "f1", "2026-01-01T00:02:00Z").unwrap());
        let row = find_by_id(&db, "f1").unwrap().unwrap();
        assert_eq!(row.status, "completed");
        assert_eq!(row.progress_percent, 100);
        assert!(row.error_message.is_none());
        assert_eq!(row.artifact_ref.as_deref(), Some("f1"));
    }

    #[test]
    fn test_raise_progress_never_lowers() {
        let db = test_db();
        insert(&db, &sample_job("r1")).unwrap();
        raise_progress(&db, "r1", 40, "a", "2026-01-01T00:01:00Z").unwrap();
        raise_progress(&db, "r1", 20, "b", "2026-01-01T00:02:00Z").unwrap();
        let row = find_by_id(&db, "r1").unwrap().unwrap();
        assert_eq!(row.progress_percent, 40);
        assert_eq!(row.updated_at, "2026-01-01T00:02:00Z");
    }

    #[test]
    fn test_raise_progress_skips_terminal_jobs() {
        let db = test_db();
        insert(&db, &sample_job("r2")).unwrap();
        transition_status(&db, "r2", &["pending"], "cancelled", "Cancelled", "t1").unwrap();
        raise_progress(&db, "r2", 50, "late batch", "t2").unwrap();
        let row = find_by_id(&db, "r2").unwrap().unwrap();
        assert_eq!(row.progress_percent, 0);
        assert_eq!(row.message.as_deref(), Some("Cancelled"));
    }

    #[test]
    fn test_set_outline_and_delete() {
        let db = test_db();
        insert(&db, &sample_job("o1")).unwrap();
        set_outline(&db, "o1", "{\"units\":[]}", 4, "2026-01-01T00:01:00Z").unwrap();
        let row = find_by_id(&db, "o1").unwrap().unwrap();
        assert_eq!(row.total_units, 4);
        assert!(row.outline.is_some());

        assert!(delete(&db, "o1").unwrap());
        assert!(!delete(&db, "o1").unwrap());
    }
}
