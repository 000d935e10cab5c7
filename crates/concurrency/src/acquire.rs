//! Wait policy for lock acquisition

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared flag that aborts pending lock waits
///
/// Clones observe the same flag. Cancelling is permanent.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel every wait observing this token
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// True once [`CancellationToken::cancel`] was called
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// How long a lock acquisition may wait, and what may abort it
///
/// The default waits forever and cannot be cancelled.
#[derive(Debug, Clone, Default)]
pub struct Acquire {
    /// Give up after this long; `None` waits indefinitely
    pub timeout: Option<Duration>,
    /// Abort the wait when this token is cancelled
    pub cancel: Option<CancellationToken>,
}

impl Acquire {
    /// Wait indefinitely
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Wait at most `timeout`
    pub fn timeout(timeout: Duration) -> Self {
        Acquire {
            timeout: Some(timeout),
            cancel: None,
        }
    }

    /// Succeed only if the lock is free right now
    pub fn immediate() -> Self {
        Self::timeout(Duration::ZERO)
    }

    /// Also abort when `token` is cancelled
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| Instant::now() + t)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    pub(crate) fn is_cancellable(&self) -> bool {
        self.cancel.is_some()
    }
}
