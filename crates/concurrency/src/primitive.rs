//! Shared/exclusive lock with bounded, cancellable waits
//!
//! `parking_lot::RwLock` cannot be cancelled mid-wait and its guards borrow
//! the lock, which does not fit handles that outlive a single call. This
//! primitive keeps its state in a mutex and parks waiters on a condvar.
//!
//! Fairness: once a writer is waiting, new readers queue behind it. Readers
//! already inside finish normally; the writer enters when they drain.

use crate::acquire::Acquire;
use parking_lot::{Condvar, Mutex, MutexGuard};
use rackdb_core::{Error, Result};
use std::time::{Duration, Instant};

/// Cancellable waits re-check their token at this interval
const CANCEL_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
    writers_waiting: usize,
}

impl LockState {
    fn admits_reader(&self) -> bool {
        !self.writer && self.writers_waiting == 0
    }

    fn admits_writer(&self) -> bool {
        !self.writer && self.readers == 0
    }
}

/// Many readers or one writer
#[derive(Debug, Default)]
pub struct SharedExclusive {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl SharedExclusive {
    /// Create an unlocked primitive
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter shared mode
    ///
    /// Returns `Ok(false)` if the wait timed out.
    pub fn acquire_shared(&self, acquire: &Acquire) -> Result<bool> {
        let mut state = self.state.lock();
        if !self.wait_for(&mut state, acquire, LockState::admits_reader)? {
            return Ok(false);
        }
        state.readers += 1;
        Ok(true)
    }

    /// Enter exclusive mode
    ///
    /// Returns `Ok(false)` if the wait timed out.
    pub fn acquire_exclusive(&self, acquire: &Acquire) -> Result<bool> {
        let mut state = self.state.lock();
        state.writers_waiting += 1;
        let outcome = self.wait_for(&mut state, acquire, LockState::admits_writer);
        state.writers_waiting -= 1;

        match outcome {
            Ok(true) => {
                state.writer = true;
                Ok(true)
            }
            other => {
                // Readers held back by this writer may proceed now.
                self.cond.notify_all();
                other
            }
        }
    }

    /// Leave shared mode
    pub fn release_shared(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.readers == 0 {
            return Err(Error::ConcurrencyViolation(
                "shared release without a shared holder".to_string(),
            ));
        }
        state.readers -= 1;
        if state.readers == 0 {
            self.cond.notify_all();
        }
        Ok(())
    }

    /// Leave exclusive mode
    pub fn release_exclusive(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.writer {
            return Err(Error::ConcurrencyViolation(
                "exclusive release without an exclusive holder".to_string(),
            ));
        }
        state.writer = false;
        self.cond.notify_all();
        Ok(())
    }

    /// Number of shared holders right now
    pub fn readers(&self) -> usize {
        self.state.lock().readers
    }

    /// True while an exclusive holder is inside
    pub fn is_exclusive(&self) -> bool {
        self.state.lock().writer
    }

    fn wait_for(
        &self,
        state: &mut MutexGuard<'_, LockState>,
        acquire: &Acquire,
        admits: fn(&LockState) -> bool,
    ) -> Result<bool> {
        let deadline = acquire.deadline();
        loop {
            if acquire.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if admits(state) {
                return Ok(true);
            }

            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            let slice = match (slice, acquire.is_cancellable()) {
                (Some(s), true) => Some(s.min(CANCEL_POLL)),
                (None, true) => Some(CANCEL_POLL),
                (s, false) => s,
            };

            match slice {
                Some(slice) => {
                    let _ = self.cond.wait_for(state, slice);
                }
                None => self.cond.wait(state),
            }
        }
    }
}
