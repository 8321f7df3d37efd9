//! Schema migrations.
//!
//! The applied version is kept in SQLite's `user_version` header field.
//! Each pending step runs in its own transaction together with the version
//! bump, so a failed step leaves the previous version intact.

use rusqlite::Connection;

use super::error::DatabaseError;

const STEPS: &[(u32, &str)] = &[
    (1, include_str!("sql/001_create_jobs.sql")),
    (2, include_str!("sql/002_create_units.sql")),
    (3, include_str!("sql/003_create_artifacts.sql")),
    (4, include_str!("sql/004_create_daily_usage.sql")),
];

pub const LATEST_VERSION: u32 = 4;

pub fn schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Applies every step newer than the stored version. Returns the version
/// the schema ends up at.
pub fn migrate(conn: &mut Connection) -> Result<u32, DatabaseError> {
    let current = schema_version(conn)?;
    if current > LATEST_VERSION {
        return Err(DatabaseError::Migration {
            version: current,
            reason: format!("database is newer than this build (v{})", LATEST_VERSION),
        });
    }

    let mut version = current;
    for &(step, sql) in STEPS.iter().filter(|(step, _)| *step > current) {
        let tx = conn.transaction()?;
        tx.execute_batch(sql).map_err(|e| DatabaseError::Migration {
            version: step,
            reason: e.to_string(),
        })?;
        tx.pragma_update(None, "user_version", step)?;
        tx.commit()?;
        log::info!("Applied schema migration v{}", step);
        version = step;
    }
    Ok(version)
}
