//! Migration metrics.
//!
//! The manager reports to a [`MigrationMetrics`] collaborator handed to it at
//! construction. [`NoopMetrics`] is the default; [`CountingMetrics`] keeps
//! lock-free counters that callers and tests can read back.

use crate::source::Direction;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Receives engine events. Implementations must be cheap and must not block.
pub trait MigrationMetrics: Send + Sync {
    /// A step committed
    fn step_succeeded(&self, version: u64, direction: Direction, elapsed: Duration);

    /// A step failed after marking the schema dirty
    fn step_failed(&self, version: u64, direction: Direction, elapsed: Duration);

    /// The migration lock was taken
    fn lock_acquired(&self, waited: Duration);

    /// Waiting for the migration lock gave up
    fn lock_timed_out(&self, waited: Duration);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MigrationMetrics for NoopMetrics {
    fn step_succeeded(&self, _version: u64, _direction: Direction, _elapsed: Duration) {}
    fn step_failed(&self, _version: u64, _direction: Direction, _elapsed: Duration) {}
    fn lock_acquired(&self, _waited: Duration) {}
    fn lock_timed_out(&self, _waited: Duration) {}
}

/// Atomic counters for every event
#[derive(Debug, Default)]
pub struct CountingMetrics {
    applied: AtomicU64,
    reverted: AtomicU64,
    failed: AtomicU64,
    step_time_ms: AtomicU64,
    lock_acquisitions: AtomicU64,
    lock_timeouts: AtomicU64,
    lock_wait_ms: AtomicU64,
}

/// Point-in-time copy of [`CountingMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub applied: u64,
    pub reverted: u64,
    pub failed: u64,
    pub step_time_ms: u64,
    pub lock_acquisitions: u64,
    pub lock_timeouts: u64,
    pub lock_wait_ms: u64,
}

impl CountingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            reverted: self.reverted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            step_time_ms: self.step_time_ms.load(Ordering::Relaxed),
            lock_acquisitions: self.lock_acquisitions.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            lock_wait_ms: self.lock_wait_ms.load(Ordering::Relaxed),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl MigrationMetrics for CountingMetrics {
    fn step_succeeded(&self, _version: u64, direction: Direction, elapsed: Duration) {
        let counter = match direction {
            Direction::Up => &self.applied,
            Direction::Down => &self.reverted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.step_time_ms
            .fetch_add(millis(elapsed), Ordering::Relaxed);
    }

    fn step_failed(&self, _version: u64, _direction: Direction, elapsed: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.step_time_ms
            .fetch_add(millis(elapsed), Ordering::Relaxed);
    }

    fn lock_acquired(&self, waited: Duration) {
        self.lock_acquisitions.fetch_add(1, Ordering::Relaxed);
        self.lock_wait_ms.fetch_add(millis(waited), Ordering::Relaxed);
    }

    fn lock_timed_out(&self, waited: Duration) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
        self.lock_wait_ms.fetch_add(millis(waited), Ordering::Relaxed);
    }
}
