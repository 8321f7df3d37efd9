//! SQLite persistence for jobs, units, artifacts and usage counters.
//!
//! A single connection sits behind a mutex and is shared by cheap clones of
//! [`Database`]. Repositories are free functions over `&Database`. Reads go
//! through [`Database::with_conn`]; writes that touch more than one row or
//! depend on a count go through [`Database::write`], which runs them in one
//! `IMMEDIATE` transaction.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Connection, Transaction, TransactionBehavior};

pub mod artifact_repo;
pub mod error;
pub mod job_repo;
pub mod migrations;
pub mod unit_repo;
pub mod usage_repo;

pub use error::DatabaseError;

const FILE_PRAGMAS: &str = "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;";
const MEMORY_PRAGMAS: &str = "PRAGMA foreign_keys=ON;";

/// Shared handle to the job store's SQLite connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens the database file, creating parent directories, and brings the
    /// schema up to date.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| DatabaseError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let db = Self::prepare(Connection::open(path)?, FILE_PRAGMAS)?;
        log::info!("Job store opened at {}", path.display());
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::prepare(Connection::open_in_memory()?, MEMORY_PRAGMAS)
    }

    fn prepare(mut conn: Connection, pragmas: &str) -> Result<Self, DatabaseError> {
        conn.execute_batch(pragmas)?;
        let version = migrations::migrate(&mut conn)?;
        log::debug!("Schema at v{}", version);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            log::warn!("Database lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Runs `f` with the connection locked.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        f(&self.lock())
    }

    /// Runs `f` in one transaction, committed only if `f` returns `Ok`.
    pub fn write<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, DatabaseError>,
    {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// `~/.manuscript/data/manuscript.db`, if a home directory is known.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".manuscript").join("data").join("manuscript.db"))
}
