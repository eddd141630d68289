//! Operation context: a deadline plus a cancellation token.
//!
//! Every engine call receives an [`OpContext`]. Lock acquisition stops
//! waiting when the context is done, and script execution checks it between
//! statements and before `COMMIT`, so an expired or cancelled context always
//! ends in a rolled-back transaction rather than a half-applied one.

use std::fmt;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Why an operation context stopped an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    /// The context deadline passed
    DeadlineExceeded,
    /// The context's cancellation token was cancelled
    Cancelled,
}

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupted::DeadlineExceeded => write!(f, "deadline exceeded"),
            Interrupted::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for Interrupted {}

/// Deadline and cancellation carrier for one engine call
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl OpContext {
    /// A context that never expires on its own
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            token: CancellationToken::new(),
        }
    }

    /// Derive a context whose deadline is the earlier of the parent's and
    /// `now + timeout`. Cancelling the parent cancels the child, not the
    /// other way round.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let own = timeout.map(|t| Instant::now() + t);
        let deadline = match (self.deadline, own) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            deadline,
            token: self.token.child_token(),
        }
    }

    /// Token that cancels this context and its children
    pub fn cancel_handle(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when there is no deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// `Err` once the context is cancelled or past its deadline
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.token.is_cancelled() {
            return Err(Interrupted::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Interrupted::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    pub fn is_done(&self) -> bool {
        self.check().is_err()
    }

    /// Resolves as soon as the context is cancelled or its deadline passes
    pub async fn done(&self) -> Interrupted {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => Interrupted::Cancelled,
                _ = tokio::time::sleep_until(deadline.into()) => Interrupted::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                Interrupted::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_never_done() {
        let ctx = OpContext::background();
        assert!(!ctx.is_done());
        assert_eq!(ctx.remaining(), None);
    }

    #[test]
    fn test_zero_timeout_is_expired() {
        let ctx = OpContext::with_timeout(Duration::ZERO);
        assert_eq!(ctx.check(), Err(Interrupted::DeadlineExceeded));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_cancel_propagates_to_child_only() {
        let parent = OpContext::background();
        let child = parent.child(Some(Duration::from_secs(60)));
        parent.cancel_handle().cancel();
        assert_eq!(child.check(), Err(Interrupted::Cancelled));

        let parent = OpContext::background();
        let child = parent.child(None);
        child.cancel_handle().cancel();
        assert!(child.is_done());
        assert!(!parent.is_done());
    }

    #[test]
    fn test_child_keeps_tighter_deadline() {
        let parent = OpContext::with_timeout(Duration::from_secs(1));
        let child = parent.child(Some(Duration::from_secs(3600)));
        assert_eq!(child.deadline(), parent.deadline());

        let loose = OpContext::background().child(Some(Duration::from_secs(5)));
        assert!(loose.deadline().is_some());

        let unbounded = OpContext::background().child(None);
        assert!(unbounded.deadline().is_none());
    }

    #[tokio::test]
    async fn test_done_wakes_on_cancel() {
        let ctx = OpContext::background();
        let token = ctx.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let started = Instant::now();
        assert_eq!(ctx.done().await, Interrupted::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_done_wakes_on_deadline() {
        let ctx = OpContext::with_timeout(Duration::from_millis(30));
        assert_eq!(ctx.done().await, Interrupted::DeadlineExceeded);
        assert!(ctx.is_done());
    }
}
