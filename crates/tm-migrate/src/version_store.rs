//! Persistent schema state: the `(version, dirty)` row and the applied history.
//!
//! The state table always holds exactly one row (`id = 1`). Every write is a
//! single statement or a single transaction, so a crash between any two
//! calls leaves a consistent row behind.

use crate::error::{StoreError, StoreResult};
use crate::source::MigrationDefinition;
use std::collections::BTreeMap;
use std::sync::Arc;
use tm_core::sql_utils::{escape_sql_string, quote_qualified, schema_of};
use tm_core::OpContext;
use tm_db::{Database, DbError, Row};

/// Persisted schema state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchemaState {
    /// Last fully applied version (0 = nothing applied)
    pub version: u64,
    /// A step started and did not finish cleanly
    pub dirty: bool,
}

/// One row of the applied history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedRecord {
    pub version: u64,
    pub name: String,
    /// Checksum of the up script that was applied
    pub checksum: String,
    /// RFC 3339 UTC timestamp
    pub applied_at: String,
}

/// Reads and writes schema state through the [`Database`] capability trait
pub struct VersionStore {
    db: Arc<dyn Database>,
    schema: Option<String>,
    table: String,
    history_table: String,
}

impl VersionStore {
    /// `table` may be schema-qualified; the history table sits next to it
    pub fn new(db: Arc<dyn Database>, table: &str) -> Self {
        Self {
            db,
            schema: schema_of(table).map(quote_qualified),
            table: quote_qualified(table),
            history_table: quote_qualified(&format!("{table}_history")),
        }
    }

    /// Create the state and history tables and the initial `(0, false)` row.
    ///
    /// Idempotent. Concurrent callers may race on table creation; a losing
    /// racer retries once and then sees the winner's tables.
    pub async fn ensure_initialized(&self) -> StoreResult<()> {
        let mut sql = String::new();
        if let Some(schema) = &self.schema {
            sql.push_str(&format!("CREATE SCHEMA IF NOT EXISTS {schema};\n"));
        }
        sql.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                 id      INTEGER PRIMARY KEY,
                 version BIGINT NOT NULL,
                 dirty   BOOLEAN NOT NULL
             );
             INSERT INTO {table} (id, version, dirty) VALUES (1, 0, false) ON CONFLICT DO NOTHING;
             CREATE TABLE IF NOT EXISTS {history} (
                 version    BIGINT PRIMARY KEY,
                 name       VARCHAR NOT NULL,
                 checksum   VARCHAR NOT NULL,
                 applied_at VARCHAR NOT NULL
             );",
            table = self.table,
            history = self.history_table,
        ));

        match self.db.execute_batch(&sql).await {
            Err(e) if e.is_conflict() => {
                log::debug!("Version table creation raced with another session, retrying: {e}");
                self.db.execute_batch(&sql).await?;
            }
            other => other?,
        }
        Ok(())
    }

    /// Read the current state
    pub async fn read(&self) -> StoreResult<SchemaState> {
        let rows = self
            .db
            .query_rows(&format!(
                "SELECT version, dirty FROM {} WHERE id = 1",
                self.table
            ))
            .await?;
        let row = rows.first().ok_or_else(|| {
            DbError::UnexpectedResult(format!("state row missing from {}", self.table))
        })?;
        Ok(SchemaState {
            version: parse_u64(row, 0)?,
            dirty: parse_bool(row, 1)?,
        })
    }

    /// Set `dirty` only if the row is exactly `(expected, false)`.
    ///
    /// This is the step-entry compare-and-set: if another session moved the
    /// version or left it dirty, nothing is written and
    /// [`StoreError::Conflict`] reports what was found.
    pub async fn mark_dirty(&self, expected: u64) -> StoreResult<()> {
        let affected = self
            .db
            .execute(&format!(
                "UPDATE {} SET dirty = true WHERE id = 1 AND version = {} AND dirty = false",
                self.table,
                as_bigint(expected)?
            ))
            .await?;
        if affected == 1 {
            return Ok(());
        }
        let found = self.read().await?;
        Err(StoreError::Conflict {
            expected,
            found: found.version,
            dirty: found.dirty,
        })
    }

    /// Set the version and clear `dirty`
    pub async fn commit(&self, version: u64) -> StoreResult<()> {
        let affected = self.db.execute(&self.commit_sql(version)?).await?;
        if affected != 1 {
            return Err(DbError::UnexpectedResult(format!(
                "commit of version {version} updated {affected} rows"
            ))
            .into());
        }
        Ok(())
    }

    /// Commit `definition.version` and record it in the history, atomically
    pub async fn commit_applied(&self, definition: &MigrationDefinition) -> StoreResult<()> {
        let applied_at = chrono::Utc::now().to_rfc3339();
        let statements = [
            self.commit_sql(definition.version)?,
            format!(
                "INSERT INTO {history} (version, name, checksum, applied_at) \
                 VALUES ({version}, '{name}', '{checksum}', '{applied_at}') \
                 ON CONFLICT (version) DO UPDATE SET \
                 name = excluded.name, checksum = excluded.checksum, applied_at = excluded.applied_at",
                history = self.history_table,
                version = as_bigint(definition.version)?,
                name = escape_sql_string(&definition.name),
                checksum = escape_sql_string(&definition.up.checksum),
            ),
        ];
        self.in_transaction(&statements).await
    }

    /// Commit `previous` and drop the history row of `reverted`, atomically
    pub async fn commit_reverted(&self, previous: u64, reverted: u64) -> StoreResult<()> {
        let statements = [
            self.commit_sql(previous)?,
            format!(
                "DELETE FROM {} WHERE version = {}",
                self.history_table,
                as_bigint(reverted)?
            ),
        ];
        self.in_transaction(&statements).await
    }

    /// Unconditionally set the version and clear `dirty`; history above
    /// `version` is discarded. No scripts run.
    pub async fn force_version(&self, version: u64) -> StoreResult<()> {
        let statements = [
            self.commit_sql(version)?,
            format!(
                "DELETE FROM {} WHERE version > {}",
                self.history_table,
                as_bigint(version)?
            ),
        ];
        self.in_transaction(&statements).await
    }

    /// Applied history keyed by version
    pub async fn applied_checksums(&self) -> StoreResult<BTreeMap<u64, AppliedRecord>> {
        let rows = self
            .db
            .query_rows(&format!(
                "SELECT version, name, checksum, applied_at FROM {} ORDER BY version",
                self.history_table
            ))
            .await?;

        let mut applied = BTreeMap::new();
        for row in &rows {
            let record = AppliedRecord {
                version: parse_u64(row, 0)?,
                name: text(row, 1)?.to_string(),
                checksum: text(row, 2)?.to_string(),
                applied_at: text(row, 3)?.to_string(),
            };
            applied.insert(record.version, record);
        }
        Ok(applied)
    }

    fn commit_sql(&self, version: u64) -> StoreResult<String> {
        Ok(format!(
            "UPDATE {} SET version = {}, dirty = false WHERE id = 1",
            self.table,
            as_bigint(version)?
        ))
    }

    /// Bookkeeping writes must land once the script has committed, so they
    /// ignore the caller's deadline and cancellation.
    async fn in_transaction(&self, statements: &[String]) -> StoreResult<()> {
        self.db
            .run_in_transaction(&OpContext::background(), statements)
            .await?;
        Ok(())
    }
}

/// Versions are stored as `BIGINT`
fn as_bigint(version: u64) -> StoreResult<i64> {
    i64::try_from(version).map_err(|_| StoreError::VersionOutOfRange { version })
}

fn text(row: &Row, index: usize) -> Result<&str, DbError> {
    row.get(index)
        .and_then(|value| value.as_deref())
        .ok_or_else(|| DbError::UnexpectedResult(format!("column {index} is NULL or missing")))
}

fn parse_u64(row: &Row, index: usize) -> Result<u64, DbError> {
    let value = text(row, index)?;
    value
        .parse()
        .map_err(|_| DbError::UnexpectedResult(format!("expected a version, got '{value}'")))
}

fn parse_bool(row: &Row, index: usize) -> Result<bool, DbError> {
    match text(row, index)? {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(DbError::UnexpectedResult(format!(
            "expected a boolean, got '{other}'"
        ))),
    }
}

#[cfg(test)]
#[path = "version_store_test.rs"]
mod tests;
