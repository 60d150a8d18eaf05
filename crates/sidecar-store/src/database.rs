use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::schema;

/// Shared handle to the results database.
///
/// rusqlite connections are `Send` but not `Sync`, so every access goes
/// through one mutex. Clones share the connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Creates parent directories as needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| StoreError::Io(format!("{}: {e}", dir.display())))?;
        }
        let conn = Connection::open(path)?;
        let db = Self::prepare(conn, path.to_path_buf())?;
        info!(path = %path.display(), "result database opened");
        Ok(db)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::prepare(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn prepare(conn: Connection, path: PathBuf) -> Result<Self, StoreError> {
        conn.execute_batch(schema::PRAGMAS)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Run `f` while holding the connection lock. Keep `f` short and synchronous.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        f(&self.conn.lock())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn user_version(conn: &Connection) -> Result<u32, StoreError> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Bring the file up to `SCHEMA_VERSION`. Files from a newer build are refused.
fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let found = user_version(conn)?;
    if found > schema::SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchema {
            found,
            supported: schema::SCHEMA_VERSION,
        });
    }
    if found < schema::SCHEMA_VERSION {
        conn.execute_batch(schema::CREATE_TABLES)?;
        conn.pragma_update(None, "user_version", schema::SCHEMA_VERSION)?;
        debug!(from = found, to = schema::SCHEMA_VERSION, "result schema migrated");
    }
    Ok(())
}
