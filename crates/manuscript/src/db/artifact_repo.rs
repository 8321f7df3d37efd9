//! Artifact repository: the assembled document for each job.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw artifact row from the database.
#[derive(Debug, Clone)]
pub struct ArtifactRow {
    pub job_id: String,
    pub content: String,
    pub is_partial: bool,
    pub created_at: String,
}

impl ArtifactRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            job_id: row.get("job_id")?,
            content: row.get("content")?,
            is_partial: row.get::<_, i64>("is_partial")? != 0,
            created_at: row.get("created_at")?,
        })
    }
}

/// Stores an artifact. A job holds at most one; an existing artifact is kept.
///
/// Returns `true` if the artifact was newly written.
pub fn insert_if_absent(db: &Database, artifact: &ArtifactRow) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO artifacts (job_id, content, is_partial, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                artifact.job_id,
                artifact.content,
                artifact.is_partial as i64,
                artifact.created_at,
            ],
        )?;
        Ok(inserted == 1)
    })
}

/// Finds the artifact for a job.
pub fn find_by_job(db: &Database, job_id: &str) -> Result<Option<ArtifactRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM artifacts WHERE job_id = ?1")?;
        let mut rows = stmt.query_map(params![job_id], ArtifactRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db_with_job(id: &str) -> Database {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO jobs (id, owner_id, input, model_selector, created_at, updated_at)
                 VALUES (?1, 'alice', '{}', 'default', 'now', 'now')",
                params![id],
            )?;
            Ok(())
        })
        .unwrap();
        db
    }

    #[test]
    fn test_insert_and_find() {
        let db = test_db_with_job("a1");
        let artifact = ArtifactRow {
            job_id: "a1".to_string(),
            content: "# Title".to_string(),
            is_partial: true,
            created_at: "2026-01-01T00:00:00Z".to_string(),
        };
        assert!(insert_if_absent(&db, &artifact).unwrap());

        let found = find_by_job(&db, "a1").unwrap().unwrap();
        assert_eq!(found.content, "# Title");
        assert!(found.is_partial);
    }

    #[test]
    fn test_second_artifact_is_ignored() {
        let db = test_db_with_job("a2");
        let mut artifact = ArtifactRow {
            job_id: "a2".to_string(),
            content: "first".to_string(),
            is_partial: false,
            created_at: "2026-01-01T00:00:00Z".to_string(),
        };
        assert!(insert_if_absent(&db, &artifact).unwrap());
        artifact.content = "second".to_string();
        assert!(!insert_if_absent(&db, &artifact).unwrap());

        assert_eq!(find_by_job(&db, "a2").unwrap().unwrap().content, "first");
    }

    #[test]
    fn test_find_missing() {
        let db = test_db_with_job("a3");
        assert!(find_by_job(&db, "a3").unwrap().is_none());
    }
}
