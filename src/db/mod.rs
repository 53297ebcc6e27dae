//! SQLite access: connection setup, the shared [`Database`] handle, and health checks.
//!
//! The handle owns exactly one writer connection behind a mutex and a small set of
//! read-only connections. Writers serialize on the mutex; readers pick any idle
//! reader connection. All work runs on tokio's blocking pool.

pub mod migrations;
pub mod schema;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use sqlite_vec::sqlite3_vec_init;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use crate::error::{MemoryError, Result, StorageContext};

static SQLITE_VEC_INIT: Once = Once::new();

const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Register the sqlite-vec extension for every connection opened afterwards.
/// Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Open (or create) the writer connection at `path` with schema and migrations applied.
pub fn open_database(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| MemoryError::storage("create data directory", None, e))?;
    }

    let mut conn = Connection::open(path).storage("open database", None)?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .storage("configure database", None)?;
    configure(&conn)?;

    schema::init_schema(&conn).storage("initialize schema", None)?;
    migrations::apply_pending(&mut conn).storage("run migrations", None)?;

    tracing::info!(path = %path.display(), "database initialized");
    Ok(conn)
}

/// Open an in-memory database with schema and migrations applied.
pub fn open_memory_database() -> Result<Connection> {
    let mut conn = Connection::open_in_memory().storage("open database", None)?;
    configure(&conn)?;
    schema::init_schema(&conn).storage("initialize schema", None)?;
    migrations::apply_pending(&mut conn).storage("run migrations", None)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")
        .storage("configure database", None)?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .storage("configure database", None)?;
    Ok(())
}

fn open_reader(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .storage("open reader", None)?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .storage("configure reader", None)?;
    conn.pragma_update(None, "query_only", "ON")
        .storage("configure reader", None)?;
    Ok(conn)
}

/// Shared handle to the memory database. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

struct Inner {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
    path: Option<PathBuf>,
}

impl Inner {
    /// Prefer an idle reader; block on one in round-robin order if all are busy.
    /// Falls back to the writer when no readers exist (in-memory databases).
    fn reader(&self) -> MutexGuard<'_, Connection> {
        if self.readers.is_empty() {
            return self.writer.lock();
        }
        let start = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        for offset in 0..self.readers.len() {
            let idx = (start + offset) % self.readers.len();
            if let Some(guard) = self.readers[idx].try_lock() {
                return guard;
            }
        }
        self.readers[start].lock()
    }
}

impl Database {
    /// Open the database file with `readers` extra read-only connections.
    pub fn open(path: impl AsRef<Path>, readers: usize) -> Result<Self> {
        let path = path.as_ref();
        let writer = open_database(path)?;
        let readers = (0..readers)
            .map(|_| open_reader(path).map(Mutex::new))
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(readers = readers.len(), "database handle ready");
        Ok(Self::from_parts(writer, readers, Some(path.to_path_buf())))
    }

    /// A private in-memory database; reads share the writer connection.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_parts(open_memory_database()?, Vec::new(), None))
    }

    fn from_parts(writer: Connection, readers: Vec<Mutex<Connection>>, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                writer: Mutex::new(writer),
                readers,
                next_reader: AtomicUsize::new(0),
                path,
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Run `op` with exclusive access to the writer connection.
    pub async fn write<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut conn = inner.writer.lock();
            op(&mut conn)
        })
        .await?
    }

    /// Run `op` on a read connection. Concurrent reads use different connections.
    pub async fn read<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let conn = inner.reader();
            op(&conn)
        })
        .await?
    }
}

/// Snapshot rendered by the `doctor` command.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub schema_version: u32,
    pub embedding_model: Option<String>,
    pub memory_count: u64,
    pub relationship_count: u64,
    pub log_count: u64,
    pub integrity_ok: bool,
    pub integrity_details: String,
}

pub fn check_database_health(conn: &Connection) -> Result<HealthReport> {
    let count = |table: &str| -> Result<u64> {
        let n: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .storage("health check", None)?;
        Ok(n as u64)
    };

    let integrity: String = conn
        .query_row("PRAGMA integrity_check", [], |row| row.get(0))
        .storage("health check", None)?;

    Ok(HealthReport {
        schema_version: migrations::schema_version(conn).storage("health check", None)?,
        embedding_model: migrations::embedding_model(conn).storage("health check", None)?,
        memory_count: count("memories")?,
        relationship_count: count("memory_relationships")?,
        log_count: count("memory_log")?,
        integrity_ok: integrity == "ok",
        integrity_details: integrity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_missing_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("memory.db");
        let conn = open_database(&path).unwrap();
        assert!(path.exists());
        let timeout: i64 = conn
            .pragma_query_value(None, "busy_timeout", |row| row.get(0))
            .unwrap();
        assert_eq!(timeout, 5000);
    }

    #[test]
    fn health_check_passes_on_fresh_db() {
        let conn = open_memory_database().unwrap();
        let report = check_database_health(&conn).unwrap();
        assert!(report.integrity_ok);
        assert_eq!(report.schema_version, migrations::CURRENT_SCHEMA_VERSION);
        assert_eq!(report.memory_count, 0);
        assert_eq!(report.relationship_count, 0);
    }

    #[tokio::test]
    async fn readers_see_committed_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::open(tmp.path().join("memory.db"), 2).unwrap();

        db.write(|conn| {
            conn.execute(
                "INSERT INTO schema_meta (key, value) VALUES ('probe', 'yes')",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let value: String = db
            .read(|conn| {
                Ok(conn.query_row(
                    "SELECT value FROM schema_meta WHERE key = 'probe'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(value, "yes");
    }

    #[tokio::test]
    async fn reader_connections_reject_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::open(tmp.path().join("memory.db"), 1).unwrap();
        let result = db
            .read(|conn| {
                conn.execute("DELETE FROM schema_meta", [])?;
                Ok(())
            })
            .await;
        assert!(result.is_err());
    }
}
