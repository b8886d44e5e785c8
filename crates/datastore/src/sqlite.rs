//! The SQLite executor.
//!
//! Wraps a rusqlite connection behind the [`Executor`](crate::driver::Executor) contract.  rusqlite is synchronous,
//! so every call hops onto the blocking pool; the connection lives behind a mutex and statements are prepared through
//! rusqlite's own prepared-statement cache.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use log::*;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::Value;

use crate::driver::{ConnectHook, ExecOutcome, Executor};
use crate::errors::{DatastoreError, Result};
use crate::values::Item;

/// Fallback environment variable consulted when no path is configured explicitly.
pub const SQLITE_PATH_ENV: &str = "TABULAR_SQLITE_PATH";

/// SQL run when a connection opens.
///
/// - Enables the busy timeout so concurrent writers wait instead of failing.
/// - Enables foreign key enforcement (though we don't expect foreign keys to be used).
const INITIAL_SQL: &str = "
PRAGMA busy_timeout = 1000;
PRAGMA foreign_keys = 1;
";

/// Configuration for [`SqliteExecutor`].
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Path to the database file.  `":memory:"` opens an in-memory database.
    pub path: String,
}

impl SqliteConfig {
    pub fn new(path: impl Into<String>) -> SqliteConfig {
        SqliteConfig { path: path.into() }
    }

    pub fn in_memory() -> SqliteConfig {
        SqliteConfig::new(":memory:")
    }

    /// Read the database path from `TABULAR_SQLITE_PATH`.
    pub fn from_env() -> Result<SqliteConfig> {
        match std::env::var(SQLITE_PATH_ENV) {
            Ok(path) => Ok(SqliteConfig::new(path)),
            Err(_) => Err(DatastoreError::Executor(format!(
                "{} is not set and no database path was configured",
                SQLITE_PATH_ENV
            ))),
        }
    }
}

pub struct SqliteExecutor {
    config: SqliteConfig,
    conn: Arc<Mutex<Option<Connection>>>,
    connected: AtomicBool,
    hooks: Mutex<Vec<ConnectHook>>,
}

impl SqliteExecutor {
    pub fn new(config: SqliteConfig) -> SqliteExecutor {
        SqliteExecutor {
            config,
            conn: Arc::new(Mutex::new(None)),
            connected: AtomicBool::new(false),
            hooks: Mutex::new(vec![]),
        }
    }

    fn lock_hooks(&self) -> MutexGuard<'_, Vec<ConnectHook>> {
        self.hooks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fire_hooks(&self) {
        for hook in self.lock_hooks().iter() {
            hook();
        }
    }

    async fn batch(&self, sql: &str) -> Result<()> {
        let conn = self.conn.clone();
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            let conn = guard
                .as_ref()
                .ok_or_else(|| DatastoreError::Executor("not connected".to_string()))?;
            conn.execute_batch(&sql).map_err(sqlite_error)
        })
        .await
        .map_err(join_error)?
    }
}

fn sqlite_error(e: rusqlite::Error) -> DatastoreError {
    DatastoreError::Executor(format!("sqlite error: {}", e))
}

fn join_error(e: tokio::task::JoinError) -> DatastoreError {
    DatastoreError::Executor(format!("blocking task failed: {}", e))
}

/// Map a bound parameter into sqlite's type system.  Structured values have already been encoded to JSON text by the
/// value processor; anything that still arrives here as an array or object serializes the same way.
fn param_to_sqlite(value: Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Sql::Integer(i)
            } else if let Some(f) = n.as_f64() {
                Sql::Real(f)
            } else {
                Sql::Text(n.to_string())
            }
        }
        Value::String(s) => Sql::Text(s),
        other => Sql::Text(other.to_string()),
    }
}

fn column_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(_) => {
            warn!("dropping blob column value; blobs are not part of the value model");
            Value::Null
        }
    }
}

#[async_trait]
impl Executor for SqliteExecutor {
    async fn execute(&self, sql: &str, params: Vec<Value>) -> Result<ExecOutcome> {
        trace!("execute: {} params={:?}", sql, params);

        let conn = self.conn.clone();
        let sql = sql.to_string();
        let args: Vec<rusqlite::types::Value> = params.into_iter().map(param_to_sqlite).collect();

        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            let conn = guard
                .as_ref()
                .ok_or_else(|| DatastoreError::Executor("not connected".to_string()))?;

            let mut stmt = conn.prepare_cached(&sql).map_err(sqlite_error)?;

            if stmt.column_count() > 0 {
                let names: Vec<String> = stmt
                    .column_names()
                    .into_iter()
                    .map(|n| n.to_string())
                    .collect();

                let mut out = vec![];
                let mut rows = stmt
                    .query(rusqlite::params_from_iter(args))
                    .map_err(sqlite_error)?;
                while let Some(row) = rows.next().map_err(sqlite_error)? {
                    let mut item = Item::new();
                    for (i, name) in names.iter().enumerate() {
                        let value = row.get_ref(i).map_err(sqlite_error)?;
                        item.insert(name.clone(), column_to_json(value));
                    }
                    out.push(item);
                }
                Ok(ExecOutcome::Rows(out))
            } else {
                let affected = stmt
                    .execute(rusqlite::params_from_iter(args))
                    .map_err(sqlite_error)?;
                let insert_id = if affected > 0 {
                    Some(conn.last_insert_rowid())
                } else {
                    None
                };
                Ok(ExecOutcome::Write {
                    affected_rows: affected as u64,
                    insert_id,
                })
            }
        })
        .await
        .map_err(join_error)?
    }

    async fn connect(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        info!("opening sqlite database at {}", self.config.path);
        let path = self.config.path.clone();
        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path).map_err(sqlite_error)?;
            conn.execute_batch(INITIAL_SQL).map_err(sqlite_error)?;
            Ok::<_, DatastoreError>(conn)
        })
        .await
        .map_err(join_error)??;

        *self.conn.lock().unwrap_or_else(|e| e.into_inner()) = Some(conn);
        self.connected.store(true, Ordering::SeqCst);
        self.fire_hooks();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(conn);
        Ok(())
    }

    async fn begin(&self) -> Result<()> {
        self.batch("BEGIN IMMEDIATE;").await
    }

    async fn commit(&self) -> Result<()> {
        self.batch("COMMIT;").await
    }

    async fn rollback(&self) -> Result<()> {
        self.batch("ROLLBACK;").await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn on_connect(&self, hook: ConnectHook) {
        let fire_now = self.is_connected();
        if fire_now {
            hook();
        }
        self.lock_hooks().push(hook);
    }
}
