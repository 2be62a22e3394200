//! Local SQLite handling for replicated state files.
//!
//! The replication engine requires WAL journaling, so every database this
//! crate creates is switched to WAL before anything else touches it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;

use userenv_shared::errors::{UserEnvError, UserEnvResult};

/// `PRAGMA user_version` stamped on freshly created databases.
pub const FRESH_USER_VERSION: i32 = 1;

/// Helper macro to convert rusqlite errors to UserEnvError.
macro_rules! db_err {
    ($result:expr) => {
        $result.map_err(|e| UserEnvError::Database(e.to_string()))
    };
}

/// SQLite database handle.
///
/// Thread-safe via `parking_lot::Mutex`.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

impl Database {
    /// Open or create the database.
    pub fn open(db_path: &Path) -> UserEnvResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = db_err!(Connection::open(db_path))?;

        // - WAL mode: required for continuous replication
        // - Busy timeout: the replicator holds short read locks
        db_err!(conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=5000;
            "
        ))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: db_path.to_path_buf(),
        })
    }

    /// Create a new, empty database stamped with [`FRESH_USER_VERSION`].
    ///
    /// Fails if a file already exists at `db_path`.
    pub fn create_fresh(db_path: &Path) -> UserEnvResult<Self> {
        if db_path.exists() {
            return Err(UserEnvError::AlreadyExists(format!(
                "database {}",
                db_path.display()
            )));
        }

        let db = Self::open(db_path)?;
        db_err!(
            db.conn()
                .pragma_update(None, "user_version", FRESH_USER_VERSION)
        )?;
        tracing::info!(
            path = %db_path.display(),
            user_version = FRESH_USER_VERSION,
            "Created new database"
        );
        Ok(db)
    }

    /// Acquire the database connection.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    pub fn user_version(&self) -> UserEnvResult<i32> {
        db_err!(
            self.conn()
                .query_row("PRAGMA user_version", [], |row| row.get(0))
        )
    }

    #[cfg(test)]
    fn journal_mode(&self) -> UserEnvResult<String> {
        db_err!(
            self.conn()
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
        )
    }
}
