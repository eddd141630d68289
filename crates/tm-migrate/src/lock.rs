//! Cross-process migration lock.
//!
//! The lock is a lease on the database: acquiring inserts an owned row with
//! an expiry, a heartbeat task keeps pushing the expiry forward, and release
//! deletes the row. A process that dies simply stops renewing, so the next
//! acquirer reclaims the lease once it has expired.

use crate::error::{LockError, LockResult};
use crate::metrics::MigrationMetrics;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tm_core::{Interrupted, OpContext};
use tm_db::{Database, DbError, DbResult};
use tokio::task::JoinHandle;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Lock key for a state table on a target database.
///
/// Sessions that manage the same table on the same database serialise;
/// anything else does not contend.
pub fn lock_key(target_id: &str, table: &str) -> String {
    let digest = Sha256::digest(format!("{target_id}/{table}").as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("tidemark-{hex}")
}

/// Acquires the migration lock for one state table
pub struct Locker {
    db: Arc<dyn Database>,
    key: String,
    timeout: Duration,
    ttl: Duration,
    metrics: Arc<dyn MigrationMetrics>,
}

impl Locker {
    pub fn new(
        db: Arc<dyn Database>,
        table: &str,
        timeout: Duration,
        ttl: Duration,
        metrics: Arc<dyn MigrationMetrics>,
    ) -> Self {
        let key = lock_key(&db.target_id(), table);
        Self {
            db,
            key,
            timeout,
            ttl,
            metrics,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait for the lock.
    ///
    /// Polls with exponential backoff until the lock is taken, the lock
    /// timeout passes, or `ctx` is done, whichever comes first.
    pub async fn acquire(&self, ctx: &OpContext) -> LockResult<LockHandle> {
        let owner = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let wait = ctx.child(Some(self.timeout));
        let mut backoff = Backoff::new();

        loop {
            if self
                .db
                .try_advisory_lock(&self.key, &owner, self.ttl)
                .await?
            {
                let waited = started.elapsed();
                self.metrics.lock_acquired(waited);
                log::info!("Acquired migration lock '{}' after {:?}", self.key, waited);
                return Ok(LockHandle::start(
                    self.db.clone(),
                    self.key.clone(),
                    owner,
                    self.ttl,
                ));
            }

            if let Err(reason) = wait.check() {
                let waited = started.elapsed();
                if reason == Interrupted::DeadlineExceeded {
                    self.metrics.lock_timed_out(waited);
                }
                return Err(wait_error(&self.key, reason, waited));
            }

            log::debug!(
                "Migration lock '{}' is held elsewhere, retrying in {:?}",
                self.key,
                backoff.next
            );
            backoff.wait(&wait).await;
        }
    }
}

/// Open a database that another process may hold exclusively.
///
/// Embedded engines such as DuckDB lock the whole database file while a
/// process has it open, so a concurrent migrator is turned away when it
/// opens the file, before it ever reaches the lease. Retries `open` with the
/// same backoff as [`Locker::acquire`] while it fails with
/// [`DbError::Locked`], bounded by `timeout` and `ctx`.
pub async fn open_contended<T>(
    ctx: &OpContext,
    target: &str,
    timeout: Duration,
    mut open: impl FnMut() -> DbResult<T>,
) -> LockResult<T> {
    let started = Instant::now();
    let wait = ctx.child(Some(timeout));
    let mut backoff = Backoff::new();

    loop {
        match open() {
            Ok(db) => return Ok(db),
            Err(DbError::Locked(detail)) => {
                if let Err(reason) = wait.check() {
                    return Err(wait_error(target, reason, started.elapsed()));
                }
                log::debug!(
                    "Database '{target}' is held by another process, retrying in {:?}: {detail}",
                    backoff.next
                );
                backoff.wait(&wait).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn wait_error(key: &str, reason: Interrupted, waited: Duration) -> LockError {
    match reason {
        Interrupted::DeadlineExceeded => LockError::Timeout {
            key: key.to_string(),
            waited,
        },
        Interrupted::Cancelled => LockError::Cancelled {
            key: key.to_string(),
        },
    }
}

/// Doubling pause between lock attempts
struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            next: INITIAL_BACKOFF,
        }
    }

    /// Sleep for the current pause, waking early when `ctx` is done
    async fn wait(&mut self, ctx: &OpContext) {
        tokio::select! {
            _ = tokio::time::sleep(self.next) => {}
            _ = ctx.done() => {}
        }
        self.next = (self.next * 2).min(MAX_BACKOFF);
    }
}

/// A held lease. Release it explicitly; dropping it releases on a best-effort basis.
pub struct LockHandle {
    db: Arc<dyn Database>,
    key: String,
    owner: String,
    lost: Arc<AtomicBool>,
    heartbeat: Option<JoinHandle<()>>,
    released: bool,
}

impl LockHandle {
    fn start(db: Arc<dyn Database>, key: String, owner: String, ttl: Duration) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let heartbeat = tokio::spawn(heartbeat(
            db.clone(),
            key.clone(),
            owner.clone(),
            ttl,
            lost.clone(),
        ));
        Self {
            db,
            key,
            owner,
            lost,
            heartbeat: Some(heartbeat),
            released: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Whether a renewal failed, so another session may now hold the lock
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// `Err(LockError::Lost)` once the lease could not be renewed
    pub fn ensure_held(&self) -> LockResult<()> {
        if self.is_lost() {
            return Err(LockError::Lost {
                key: self.key.clone(),
            });
        }
        Ok(())
    }

    /// Stop renewing and delete the lease
    pub async fn release(mut self) -> LockResult<()> {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
            // the task owns a database handle; wait until it is dropped
            let _ = task.await;
        }
        self.released = true;
        self.db.advisory_unlock(&self.key, &self.owner).await?;
        log::debug!("Released migration lock '{}'", self.key);
        Ok(())
    }

    fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("lost", &self.is_lost())
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.stop_heartbeat();
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!(
                "Migration lock '{}' dropped outside a runtime; it frees itself when the lease expires",
                self.key
            );
            return;
        };
        let db = self.db.clone();
        let key = std::mem::take(&mut self.key);
        let owner = std::mem::take(&mut self.owner);
        runtime.spawn(async move {
            if let Err(e) = db.advisory_unlock(&key, &owner).await {
                log::warn!("Best-effort release of migration lock '{key}' failed: {e}");
            }
        });
    }
}

/// Renew every `ttl / 3` until aborted or a renewal fails
async fn heartbeat(
    db: Arc<dyn Database>,
    key: String,
    owner: String,
    ttl: Duration,
    lost: Arc<AtomicBool>,
) {
    let period = (ttl / 3).max(Duration::from_millis(10));
    loop {
        tokio::time::sleep(period).await;
        match db.renew_advisory_lock(&key, &owner, ttl).await {
            Ok(true) => log::debug!("Renewed migration lock '{key}'"),
            Ok(false) => {
                log::warn!("Migration lock '{key}' expired and was taken over");
                lost.store(true, Ordering::SeqCst);
                return;
            }
            Err(e) => {
                log::warn!("Renewing migration lock '{key}' failed: {e}");
                lost.store(true, Ordering::SeqCst);
                return;
            }
        }
    }
}

#[cfg(test)]
#[path = "lock_test.rs"]
mod tests;
