//! SQLite adapter, used for single-node deployments and hermetic tests.

mod row_helpers;
mod sessions;

pub use sessions::SqliteSessionRepo;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;
use crate::schema;

/// One serialised SQLite connection shared by every clone. Calls block; the
/// repository runs them on the blocking pool.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    location: PathBuf,
}

impl Database {
    /// Open (creating parent directories and schema as needed) the file at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| {
                StoreError::Unavailable(format!("cannot create {}: {e}", dir.display()))
            })?;
        }
        let conn = Connection::open(path).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let db = Self::bootstrap(conn, path.to_owned())?;
        info!(path = %path.display(), "sqlite store opened");
        Ok(db)
    }

    /// Private database that vanishes with the last clone.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::bootstrap(conn, PathBuf::from(":memory:"))
    }

    fn bootstrap(conn: Connection, location: PathBuf) -> Result<Self, StoreError> {
        conn.execute_batch(schema::SQLITE_PRAGMAS)
            .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;
        conn.execute_batch(schema::SQLITE_TABLES)
            .map_err(|e| StoreError::Database(format!("schema: {e}")))?;
        conn.execute(
            "INSERT INTO schema_version (version)
             SELECT ?1 WHERE NOT EXISTS (SELECT 1 FROM schema_version)",
            [schema::SCHEMA_VERSION],
        )
        .map_err(|e| StoreError::Database(format!("schema version: {e}")))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            location,
        })
    }

    /// Run `f` while holding the connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        f(&self.conn.lock())
    }

    /// File path, or `:memory:`.
    pub fn path(&self) -> &Path {
        &self.location
    }

    pub fn schema_version(&self) -> Result<u32, StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
                .map_err(StoreError::from)
        })
    }
}
