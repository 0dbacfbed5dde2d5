// =============================================================================
// Persistent Store — SQLite behind an async facade
// =============================================================================
//
// Two deployment patterns share the same `Database` interface:
//
//   1. **Persistent single connection** (polling services): opened once at
//      startup, owned by the service loop, reused for every access.
//   2. **Bounded pool** (HTTP server): up to `max_size` connections guarded
//      by a counting semaphore. A connection that raised during use is
//      discarded, never returned to the pool.
//
// Every call moves the connection into `spawn_blocking`, so SQLite work
// never stalls the event loop. There is no automatic reconnect; a
// non-connected access fails with `DbError::NotConnected` and SQL errors
// are surfaced verbatim for the caller to decide.
// =============================================================================

pub mod admin;
pub mod queries;
pub mod settings_store;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

use crate::settings::Settings;

/// Positional SQL parameters. Timestamps are bound pre-formatted (see
/// `utils::format_recording_time`), so no driver-level adapters are needed.
pub type SqlParams = Vec<Value>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database not connected")]
    NotConnected,
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("database task failed: {0}")]
    Task(String),
}

pub type DbResult<T> = Result<T, DbError>;

// =============================================================================
// Schema
// =============================================================================

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS reading (
    temperature     REAL NOT NULL,
    humidity        REAL NOT NULL,
    recording_time  TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_reading_time ON reading (recording_time);

CREATE TABLE IF NOT EXISTS pico_reading (
    plant_id        INTEGER NOT NULL,
    moisture        REAL NOT NULL,
    recording_time  TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pico_reading_plant_time
    ON pico_reading (plant_id, recording_time);

CREATE TABLE IF NOT EXISTS settings (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    updated_at  TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS admin (
    id             INTEGER PRIMARY KEY CHECK (id = 1),
    password_hash  TEXT NOT NULL,
    updated_at     TIMESTAMP NOT NULL
);
";

// =============================================================================
// Database
// =============================================================================

/// One SQLite connection with async access methods.
pub struct Database {
    path: PathBuf,
    busy_timeout: Duration,
    conn: Option<Connection>,
    /// Set when a call returned a SQLite error; the pool uses this to
    /// discard the connection instead of returning it.
    broken: bool,
}

impl Database {
    pub fn new(path: impl AsRef<Path>, busy_timeout: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout,
            conn: None,
            broken: false,
        }
    }

    /// Database configured from settings (`DB_PATH`, `DB_TIMEOUT_SEC`).
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            &settings.db_path,
            Duration::from_secs_f64(settings.db_timeout_sec),
        )
    }

    /// Open the connection. Idempotent.
    pub async fn connect(&mut self) -> DbResult<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
            let conn = Connection::open(path)?;
            conn.busy_timeout(busy_timeout)?;
            Ok(conn)
        })
        .await
        .map_err(|e| DbError::Task(e.to_string()))??;
        self.conn = Some(conn);
        Ok(())
    }

    /// Close the connection. Idempotent.
    pub async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = tokio::task::spawn_blocking(move || conn.close()).await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Move the connection into a blocking task, run `f`, and put it back.
    async fn with_conn<T, F>(&mut self, f: F) -> DbResult<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut conn = self.conn.take().ok_or(DbError::NotConnected)?;
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut conn);
            (conn, result)
        })
        .await
        .map_err(|e| DbError::Task(e.to_string()))?;
        self.conn = Some(conn);
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                self.broken = true;
                Err(DbError::Sqlite(e))
            }
        }
    }

    /// Execute a statement, returning the number of affected rows.
    pub async fn execute(&mut self, sql: &str, params: SqlParams) -> DbResult<usize> {
        let sql = sql.to_string();
        self.with_conn(move |conn| conn.execute(&sql, params_from_iter(params)))
            .await
    }

    /// Execute one statement for each parameter set, in a single
    /// transaction.
    pub async fn execute_many(&mut self, sql: &str, params_seq: Vec<SqlParams>) -> DbResult<()> {
        let sql = sql.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(&sql)?;
                for params in params_seq {
                    stmt.execute(params_from_iter(params))?;
                }
            }
            tx.commit()
        })
        .await
    }

    /// Fetch a single row mapped through `map`, or `None`.
    pub async fn fetch_one<T, F>(&mut self, sql: &str, params: SqlParams, map: F) -> DbResult<Option<T>>
    where
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sql = sql.to_string();
        self.with_conn(move |conn| {
            conn.query_row(&sql, params_from_iter(params), map).optional()
        })
        .await
    }

    /// Fetch all rows mapped through `map`.
    pub async fn fetch_all<T, F>(&mut self, sql: &str, params: SqlParams, map: F) -> DbResult<Vec<T>>
    where
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sql = sql.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(params), map)?;
            rows.collect()
        })
        .await
    }

    /// Run `f` inside a transaction: committed on `Ok`, rolled back on
    /// `Err` (or if the closure panics, via drop).
    pub async fn transaction<T, F>(&mut self, f: F) -> DbResult<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
    }

    /// Execute a single PRAGMA directly on the connection. Pragmas like
    /// `journal_mode` report their new value as a row; it is drained and
    /// discarded here.
    pub async fn pragma(&mut self, pragma: &str) -> DbResult<()> {
        let pragma = pragma.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&pragma)?;
            let mut rows = stmt.query([])?;
            while rows.next()?.is_some() {}
            Ok(())
        })
        .await
    }

    /// Execute multiple statements (schema scripts).
    pub async fn execute_batch(&mut self, sql: &str) -> DbResult<()> {
        let sql = sql.to_string();
        self.with_conn(move |conn| conn.execute_batch(&sql)).await
    }
}

// =============================================================================
// Startup initialisation
// =============================================================================

/// Open `db`, apply connection pragmas, create missing tables, and seed the
/// admin password from `ADMIN_PASSWORD` when the admin row is absent.
///
/// Called once at startup by every service that owns a persistent
/// connection, and by the server before building its pool.
pub async fn init_db(db: &mut Database, settings: &Settings) -> DbResult<()> {
    db.connect().await?;
    db.pragma("PRAGMA journal_mode=WAL").await?;
    db.pragma("PRAGMA auto_vacuum=INCREMENTAL").await?;
    db.execute_batch(SCHEMA_SQL).await?;
    admin::seed_admin_password(db, settings.admin_password.as_deref()).await?;
    info!(path = %settings.db_path, "database initialised");
    Ok(())
}

// =============================================================================
// ConnectionPool
// =============================================================================

struct PoolInner {
    path: PathBuf,
    busy_timeout: Duration,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<Database>>,
    closed: AtomicBool,
}

/// Bounded connection pool for the HTTP server.
///
/// Acquisition is gated by a counting semaphore; connections are created on
/// demand and reused when returned clean. `close()` drains the idle set;
/// the pool stays usable afterwards (fresh connections are opened on the
/// next acquire), matching the close-and-reopen lifecycle of the server.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(path: impl AsRef<Path>, busy_timeout: Duration, max_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                path: path.as_ref().to_path_buf(),
                busy_timeout,
                semaphore: Arc::new(Semaphore::new(max_size)),
                idle: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            &settings.db_path,
            Duration::from_secs_f64(settings.db_timeout_sec),
            settings.db_pool_size,
        )
    }

    /// Acquire a connection, waiting if all `max_size` are in use.
    pub async fn acquire(&self) -> DbResult<PooledConnection> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(DbError::NotConnected);
        }
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| DbError::Task(e.to_string()))?;

        let mut db = self
            .inner
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| Database::new(&self.inner.path, self.inner.busy_timeout));
        if !db.is_connected() {
            db.connect().await?;
        }

        Ok(PooledConnection {
            db: Some(db),
            inner: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Drain and close every idle connection. The pool accepts new
    /// acquires afterwards (fresh connections are opened on demand).
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let drained: Vec<Database> = self.inner.idle.lock().drain(..).collect();
        let count = drained.len();
        for mut db in drained {
            db.close().await;
        }
        self.inner.closed.store(false, Ordering::SeqCst);
        if count > 0 {
            info!(count, "closed pooled connections");
        }
    }
}

/// RAII guard around a pooled [`Database`]. Dereferences to the inner
/// connection; returns it to the pool on drop unless it broke during use.
pub struct PooledConnection {
    db: Option<Database>,
    inner: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl std::ops::Deref for PooledConnection {
    type Target = Database;

    fn deref(&self) -> &Database {
        self.db.as_ref().expect("connection taken")
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Database {
        self.db.as_mut().expect("connection taken")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(db) = self.db.take() {
            if db.is_broken() {
                warn!("discarding broken pooled connection");
                // Dropped here; the underlying connection closes with it.
            } else if !self.inner.closed.load(Ordering::SeqCst) {
                self.inner.idle.lock().push(db);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{format_recording_time, utc_now};

    async fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::new(dir.path().join("test.sqlite3"), Duration::from_secs(5));
        db.connect().await.unwrap();
        db.execute_batch(SCHEMA_SQL).await.unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn not_connected_access_fails() {
        let db_file = tempfile::tempdir().unwrap();
        let mut db = Database::new(db_file.path().join("x.sqlite3"), Duration::from_secs(1));
        let err = db.execute("SELECT 1", vec![]).await.unwrap_err();
        assert!(matches!(err, DbError::NotConnected));
    }

    #[tokio::test]
    async fn insert_and_fetch_round_trip() {
        let (_dir, mut db) = test_db().await;
        let now = format_recording_time(utc_now());
        db.execute(
            "INSERT INTO reading VALUES (?1, ?2, ?3)",
            vec![Value::from(21.5), Value::from(55.0), Value::from(now.clone())],
        )
        .await
        .unwrap();

        let row = db
            .fetch_one(
                "SELECT temperature, humidity, recording_time FROM reading",
                vec![],
                |row| {
                    Ok((
                        row.get::<_, f64>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row, (21.5, 55.0, now));
    }

    #[tokio::test]
    async fn execute_many_inserts_all_rows() {
        let (_dir, mut db) = test_db().await;
        let now = format_recording_time(utc_now());
        let rows: Vec<SqlParams> = (1..=3)
            .map(|plant| {
                vec![
                    Value::from(plant as i64),
                    Value::from(40.0 + plant as f64),
                    Value::from(now.clone()),
                ]
            })
            .collect();
        db.execute_many("INSERT INTO pico_reading VALUES (?1, ?2, ?3)", rows)
            .await
            .unwrap();

        let count = db
            .fetch_one("SELECT COUNT(*) FROM pico_reading", vec![], |row| {
                row.get::<_, i64>(0)
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_error() {
        let (_dir, mut db) = test_db().await;
        let result = db
            .transaction(|tx| {
                tx.execute(
                    "INSERT INTO settings VALUES ('threshold.temperature.max', '30', '2025-01-01 00:00:00')",
                    [],
                )?;
                // Duplicate primary key forces the whole transaction back.
                tx.execute(
                    "INSERT INTO settings VALUES ('threshold.temperature.max', '31', '2025-01-01 00:00:00')",
                    [],
                )?;
                Ok(())
            })
            .await;
        assert!(result.is_err());

        let count = db
            .fetch_one("SELECT COUNT(*) FROM settings", vec![], |row| {
                row.get::<_, i64>(0)
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn sql_error_marks_connection_broken() {
        let (_dir, mut db) = test_db().await;
        assert!(!db.is_broken());
        let err = db.execute("SELECT * FROM missing_table", vec![]).await;
        assert!(matches!(err, Err(DbError::Sqlite(_))));
        assert!(db.is_broken());
    }

    #[tokio::test]
    async fn pool_bounds_concurrent_acquisition() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(dir.path().join("pool.sqlite3"), Duration::from_secs(5), 2);

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        // Third acquire must wait until a guard is dropped.
        let pending = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(pending.is_err());

        drop(first);
        let third = pool.acquire().await.unwrap();
        drop(second);
        drop(third);
    }

    #[tokio::test]
    async fn pool_reuses_clean_connections_and_survives_close() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(dir.path().join("pool.sqlite3"), Duration::from_secs(5), 2);

        {
            let mut conn = pool.acquire().await.unwrap();
            conn.pragma("PRAGMA user_version = 7").await.unwrap();
        }
        pool.close().await;

        // Pool reopens transparently on next acquire.
        let mut conn = pool.acquire().await.unwrap();
        conn.execute("CREATE TABLE t (x INTEGER)", vec![]).await.unwrap();
    }

    #[tokio::test]
    async fn init_db_creates_tables() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("init.sqlite3").to_string_lossy().into_owned();
        let settings = crate::settings::Settings::for_tests(&db_path);
        let mut db = Database::from_settings(&settings);
        init_db(&mut db, &settings).await.unwrap();

        for table in ["reading", "pico_reading", "settings", "admin"] {
            let found = db
                .fetch_one(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    vec![Value::from(table.to_string())],
                    |row| row.get::<_, String>(0),
                )
                .await
                .unwrap();
            assert_eq!(found.as_deref(), Some(table));
        }
    }
}
