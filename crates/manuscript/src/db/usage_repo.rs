//! Daily usage repository: per-owner submission counters.

use rusqlite::{params, Connection, OptionalExtension};

use super::{Database, DatabaseError};

/// Adds one submission for `owner_id` on `date` (`YYYY-MM-DD`, UTC).
pub(super) fn bump(conn: &Connection, owner_id: &str, date: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO daily_usage (owner_id, date, submissions)
         VALUES (?1, ?2, 1)
         ON CONFLICT(owner_id, date) DO UPDATE SET submissions = submissions + 1",
        params![owner_id, date],
    )?;
    Ok(())
}

pub(super) fn count(conn: &Connection, owner_id: &str, date: &str) -> Result<u64, DatabaseError> {
    let count: Option<i64> = conn
        .query_row(
            "SELECT submissions FROM daily_usage WHERE owner_id = ?1 AND date = ?2",
            params![owner_id, date],
            |r| r.get(0),
        )
        .optional()?;
    Ok(count.unwrap_or(0) as u64)
}

/// Returns the number of submissions recorded for `owner_id` on `date`.
pub fn submissions_on(db: &Database, owner_id: &str, date: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| count(conn, owner_id, date))
}
