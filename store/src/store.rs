//! Store - single-writer handle over the embedded database
//!
//! The store exclusively owns all persisted rows; callers receive
//! read-only snapshots and mutate through store operations. Writes are
//! serialized by the owning connection.

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::StoreResult;
use crate::schema::ensure_schema;

/// Database file name inside the state directory
pub const DB_FILE: &str = "apex.db";

/// Durable, transactional access to tasks, dependencies, checkpoints,
/// logs, gates, and idle tasks.
pub struct Store {
    pub(crate) conn: Connection,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) the database under the given state directory,
    /// e.g. `<project>/.apex/`. Applies migrations.
    pub fn open(state_dir: impl AsRef<Path>) -> StoreResult<Self> {
        let state_dir = state_dir.as_ref();
        std::fs::create_dir_all(state_dir)?;
        let db_path = state_dir.join(DB_FILE);

        debug!(path = %db_path.display(), "opening store");
        let conn = Connection::open(&db_path)?;
        configure(&conn)?;
        ensure_schema(&conn)?;

        info!(path = %db_path.display(), "store opened");
        Ok(Self {
            conn,
            path: Some(db_path),
        })
    }

    /// In-memory store for tests
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        ensure_schema(&conn)?;
        Ok(Self { conn, path: None })
    }

    /// Path of the backing database file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run a closure inside a transaction; rolls back on error
    pub(crate) fn with_tx<T>(
        &mut self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let tx = self.conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

fn configure(conn: &Connection) -> StoreResult<()> {
    // WAL gives readers a consistent view while the daemon writes
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(())
}
