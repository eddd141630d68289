//! DuckDB database backend implementation

use crate::error::{DbError, DbResult};
use crate::traits::{DatabaseCore, DatabaseLock, DatabaseTransaction, Row};
use async_trait::async_trait;
use duckdb::types::Value;
use duckdb::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tm_core::sql_utils::escape_sql_string;
use tm_core::OpContext;

/// Lease table backing the advisory lock
const LOCK_TABLE: &str = "tidemark_locks";

/// DuckDB database backend
///
/// Holds two connections to the same database instance: one for migration
/// work and one reserved for lock traffic, so lease renewal never waits
/// behind a long-running script.
pub struct DuckDbBackend {
    conn: Mutex<Connection>,
    lock_conn: Mutex<Connection>,
    target: String,
}

impl DuckDbBackend {
    /// Create a new in-memory DuckDB connection
    pub fn in_memory() -> DbResult<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| DbError::ConnectionError(e.to_string()))?;
        Self::from_connection(conn, ":memory:".to_string())
    }

    /// Create a new DuckDB connection from a file path.
    ///
    /// DuckDB lets one process at a time open a database file; while another
    /// process holds it this fails with [`DbError::Locked`].
    pub fn from_path(path: &Path) -> DbResult<Self> {
        let conn = Connection::open(path).map_err(|e| open_error(&e.to_string(), path))?;
        let target = std::fs::canonicalize(path)
            .unwrap_or_else(|_| path.to_path_buf())
            .display()
            .to_string();
        Self::from_connection(conn, target)
    }

    /// Create from path string (handles :memory: special case)
    pub fn new(path: &str) -> DbResult<Self> {
        if path == ":memory:" {
            Self::in_memory()
        } else {
            Self::from_path(Path::new(path))
        }
    }

    fn from_connection(conn: Connection, target: String) -> DbResult<Self> {
        let lock_conn = conn
            .try_clone()
            .map_err(|e| DbError::ConnectionError(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
            lock_conn: Mutex::new(lock_conn),
            target,
        })
    }

    /// Open a second, independent session on the same database instance.
    ///
    /// The clone behaves like another client: its transactions and lock
    /// leases are separate from this backend's.
    pub fn try_clone(&self) -> DbResult<Self> {
        let conn = self
            .work()?
            .try_clone()
            .map_err(|e| DbError::ConnectionError(e.to_string()))?;
        Self::from_connection(conn, self.target.clone())
    }

    fn work(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| DbError::MutexPoisoned(e.to_string()))
    }

    fn locking(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.lock_conn
            .lock()
            .map_err(|e| DbError::MutexPoisoned(e.to_string()))
    }

    /// Execute SQL synchronously
    fn execute_sync(&self, sql: &str) -> DbResult<usize> {
        let conn = self.work()?;
        conn.execute(sql, [])
            .map_err(|e| DbError::ExecutionError(format!("{}: {}", e, sql)))
    }

    /// Execute batch SQL synchronously
    fn execute_batch_sync(&self, sql: &str) -> DbResult<()> {
        let conn = self.work()?;
        conn.execute_batch(sql)
            .map_err(|e| DbError::ExecutionError(e.to_string()))
    }

    /// Query rows synchronously
    fn query_rows_sync(&self, sql: &str) -> DbResult<Vec<Row>> {
        let conn = self.work()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| DbError::ExecutionError(format!("{}: {}", e, sql)))?;
        let rows = stmt
            .query_map([], |row| {
                let width = row.as_ref().column_count();
                (0..width)
                    .map(|i| row.get::<_, Value>(i).map(render_value))
                    .collect::<Result<Row, _>>()
            })
            .map_err(|e| DbError::ExecutionError(format!("{}: {}", e, sql)))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| DbError::ExecutionError(e.to_string()))
    }

    /// Run statements inside BEGIN/COMMIT, rolling back on error or interruption
    fn run_in_transaction_sync(&self, ctx: &OpContext, statements: &[String]) -> DbResult<()> {
        let conn = self.work()?;
        ctx.check()?;

        conn.execute_batch("BEGIN TRANSACTION")
            .map_err(|e| DbError::TransactionError(format!("BEGIN failed: {e}")))?;

        let result = statements
            .iter()
            .enumerate()
            .try_for_each(|(i, statement)| {
                ctx.check()?;
                log::debug!("Executing statement {}/{}", i + 1, statements.len());
                conn.execute_batch(statement).map_err(|e| {
                    DbError::ExecutionError(format!("statement {} failed: {}", i + 1, e))
                })
            })
            .and_then(|()| ctx.check().map_err(DbError::from));

        match result {
            Ok(()) => {
                if let Err(commit_err) = conn.execute_batch("COMMIT") {
                    rollback(&conn, "failed COMMIT");
                    return Err(DbError::TransactionError(format!(
                        "COMMIT failed: {commit_err}"
                    )));
                }
                Ok(())
            }
            Err(err) => {
                rollback(&conn, "failed transaction");
                Err(err)
            }
        }
    }

    fn ensure_lock_table(conn: &Connection) -> DbResult<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {LOCK_TABLE} (
                 lock_key      VARCHAR PRIMARY KEY,
                 owner         VARCHAR NOT NULL,
                 expires_at_ms BIGINT NOT NULL
             )"
        ))
        .map_err(|e| DbError::ExecutionError(format!("failed to create lock table: {e}")))
    }

    fn try_lock_sync(&self, key: &str, owner: &str, ttl: Duration) -> DbResult<bool> {
        let conn = self.locking()?;
        Self::ensure_lock_table(&conn)?;

        let now = now_millis();
        let key_lit = escape_sql_string(key);
        let owner_lit = escape_sql_string(owner);

        let reclaimed = conn.execute(
            &format!(
                "DELETE FROM {LOCK_TABLE} WHERE lock_key = '{key_lit}' AND expires_at_ms < {now}"
            ),
            [],
        )?;
        if reclaimed > 0 {
            log::warn!("Reclaimed expired lock lease '{key}'");
        }

        conn.execute(
            &format!(
                "INSERT INTO {LOCK_TABLE} (lock_key, owner, expires_at_ms) \
                 VALUES ('{key_lit}', '{owner_lit}', {}) ON CONFLICT DO NOTHING",
                now + ttl_millis(ttl)
            ),
            [],
        )?;

        let holder: Option<String> = conn
            .query_row(
                &format!("SELECT owner FROM {LOCK_TABLE} WHERE lock_key = '{key_lit}'"),
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                duckdb::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        Ok(holder.as_deref() == Some(owner))
    }

    fn renew_lock_sync(&self, key: &str, owner: &str, ttl: Duration) -> DbResult<bool> {
        let conn = self.locking()?;
        let updated = conn.execute(
            &format!(
                "UPDATE {LOCK_TABLE} SET expires_at_ms = {} \
                 WHERE lock_key = '{}' AND owner = '{}'",
                now_millis() + ttl_millis(ttl),
                escape_sql_string(key),
                escape_sql_string(owner)
            ),
            [],
        )?;
        Ok(updated > 0)
    }

    fn unlock_sync(&self, key: &str, owner: &str) -> DbResult<()> {
        let conn = self.locking()?;
        Self::ensure_lock_table(&conn)?;
        conn.execute(
            &format!(
                "DELETE FROM {LOCK_TABLE} WHERE lock_key = '{}' AND owner = '{}'",
                escape_sql_string(key),
                escape_sql_string(owner)
            ),
            [],
        )?;
        Ok(())
    }
}

/// Render a DuckDB value as text; NULL becomes `None`
fn render_value(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Boolean(b) => Some(b.to_string()),
        Value::TinyInt(i) => Some(i.to_string()),
        Value::SmallInt(i) => Some(i.to_string()),
        Value::Int(i) => Some(i.to_string()),
        Value::BigInt(i) => Some(i.to_string()),
        Value::HugeInt(i) => Some(i.to_string()),
        Value::UTinyInt(i) => Some(i.to_string()),
        Value::USmallInt(i) => Some(i.to_string()),
        Value::UInt(i) => Some(i.to_string()),
        Value::UBigInt(i) => Some(i.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Double(f) => Some(f.to_string()),
        Value::Text(s) => Some(s),
        other => Some(format!("{other:?}")),
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX / 2)
}

#[async_trait]
impl DatabaseCore for DuckDbBackend {
    async fn execute(&self, sql: &str) -> DbResult<usize> {
        self.execute_sync(sql)
    }

    async fn execute_batch(&self, sql: &str) -> DbResult<()> {
        self.execute_batch_sync(sql)
    }

    async fn query_rows(&self, sql: &str) -> DbResult<Vec<Row>> {
        self.query_rows_sync(sql)
    }

    fn db_type(&self) -> &'static str {
        "duckdb"
    }

    fn target_id(&self) -> String {
        self.target.clone()
    }
}

#[async_trait]
impl DatabaseTransaction for DuckDbBackend {
    async fn run_in_transaction(&self, ctx: &OpContext, statements: &[String]) -> DbResult<()> {
        self.run_in_transaction_sync(ctx, statements)
    }
}

#[async_trait]
impl DatabaseLock for DuckDbBackend {
    async fn try_advisory_lock(&self, key: &str, owner: &str, ttl: Duration) -> DbResult<bool> {
        match self.try_lock_sync(key, owner, ttl) {
            Err(e) if e.is_conflict() => {
                log::debug!("Lock attempt on '{key}' hit a concurrent writer: {e}");
                Ok(false)
            }
            other => other,
        }
    }

    async fn renew_advisory_lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> DbResult<bool> {
        self.renew_lock_sync(key, owner, ttl)
    }

    async fn advisory_unlock(&self, key: &str, owner: &str) -> DbResult<()> {
        self.unlock_sync(key, owner)
    }
}

/// Roll back after a failed transaction; a failing ROLLBACK is only logged
fn rollback(conn: &Connection, after: &str) {
    if let Err(e) = conn.execute_batch("ROLLBACK") {
        log::warn!("ROLLBACK after {after} also failed: {e}");
    }
}

fn open_error(message: &str, path: &Path) -> DbError {
    if message.contains("Could not set lock on file") {
        DbError::Locked(format!("{}: {}", path.display(), message))
    } else {
        DbError::ConnectionError(format!("{}: {}", message, path.display()))
    }
}

#[cfg(test)]
#[path = "duckdb_test.rs"]
mod tests;
