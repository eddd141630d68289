//! Database capability traits
//!
//! The engine only needs three things from a backend: run statements, run a
//! script as one transaction, and hold an advisory lock. Each capability is
//! its own trait; [`Database`] is the union every backend provides.

use crate::error::DbResult;
use async_trait::async_trait;
use std::time::Duration;
use tm_core::OpContext;

/// One result row, every value rendered as text (`None` for SQL NULL)
pub type Row = Vec<Option<String>>;

/// Plain statement execution and queries
#[async_trait]
pub trait DatabaseCore: Send + Sync {
    /// Execute SQL that modifies data, returns affected rows
    async fn execute(&self, sql: &str) -> DbResult<usize>;

    /// Execute multiple SQL statements in auto-commit mode
    async fn execute_batch(&self, sql: &str) -> DbResult<()>;

    /// Run a query and return all rows
    async fn query_rows(&self, sql: &str) -> DbResult<Vec<Row>>;

    /// Database type identifier for logging and dialect selection
    fn db_type(&self) -> &'static str;

    /// Stable identifier of the target database, used to derive lock keys
    fn target_id(&self) -> String;
}

/// Transactional script execution
#[async_trait]
pub trait DatabaseTransaction: Send + Sync {
    /// Run `statements` in order inside a single transaction.
    ///
    /// `ctx` is checked before `BEGIN`, between statements and before
    /// `COMMIT`; if it is done the transaction is rolled back and
    /// [`DbError::Interrupted`](crate::DbError::Interrupted) is returned. Any
    /// statement failure also rolls back everything the call did.
    async fn run_in_transaction(&self, ctx: &OpContext, statements: &[String]) -> DbResult<()>;
}

/// Session-scoped advisory locking.
///
/// Locks are leases: a holder that stops renewing loses the lock once `ttl`
/// has passed, so a crashed process never wedges it permanently.
#[async_trait]
pub trait DatabaseLock: Send + Sync {
    /// Try once to take the lock `key` for `owner`; `false` if someone else holds it
    async fn try_advisory_lock(&self, key: &str, owner: &str, ttl: Duration) -> DbResult<bool>;

    /// Extend `owner`'s lease on `key`; `false` if `owner` no longer holds it
    async fn renew_advisory_lock(&self, key: &str, owner: &str, ttl: Duration)
        -> DbResult<bool>;

    /// Release `owner`'s lease on `key`; releasing a lock not held is a no-op
    async fn advisory_unlock(&self, key: &str, owner: &str) -> DbResult<()>;
}

/// Full capability set the migration engine is written against
pub trait Database: DatabaseCore + DatabaseTransaction + DatabaseLock {}

impl<T: DatabaseCore + DatabaseTransaction + DatabaseLock> Database for T {}
