//! Collaborator contracts consumed by the storage engine
//!
//! The table of contents rebuilds itself off the caller's critical path.
//! It does not care who runs that work, only that it can hand a task to a
//! [`Scheduler`] and get back a [`Completion`] it can wait on.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

/// Unit of work handed to a [`Scheduler`]
pub type Task = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Runs work and reports when it finished
///
/// Thread safety: implementations are shared between the store and its
/// background tasks and must be `Send + Sync`.
pub trait Scheduler: Send + Sync {
    /// Run `task` and return a handle that completes with its outcome
    fn schedule(&self, task: Task) -> Completion;
}

/// Scheduler that runs every task on the calling thread
///
/// The returned [`Completion`] is already complete.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineScheduler;

impl Scheduler for InlineScheduler {
    fn schedule(&self, task: Task) -> Completion {
        match task() {
            Ok(()) => Completion::done(),
            Err(e) => Completion::failed(e.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
enum CompletionState {
    Pending,
    Succeeded,
    Failed(String),
}

#[derive(Debug)]
struct CompletionInner {
    state: Mutex<CompletionState>,
    cond: Condvar,
}

/// Awaitable outcome of a scheduled task
///
/// Cloning shares the same underlying state; any number of threads may
/// wait on it.
#[derive(Debug, Clone)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

/// Write side of a [`Completion`]
///
/// Dropping a completer that never reported marks the completion failed,
/// so waiters are never stranded.
#[derive(Debug)]
pub struct Completer {
    inner: Option<Arc<CompletionInner>>,
}

impl Completion {
    fn with_state(state: CompletionState) -> Self {
        Completion {
            inner: Arc::new(CompletionInner {
                state: Mutex::new(state),
                cond: Condvar::new(),
            }),
        }
    }

    /// A completion that has not finished yet, plus its completer
    pub fn pending() -> (Completion, Completer) {
        let completion = Self::with_state(CompletionState::Pending);
        let completer = Completer {
            inner: Some(Arc::clone(&completion.inner)),
        };
        (completion, completer)
    }

    /// An already successful completion
    pub fn done() -> Self {
        Self::with_state(CompletionState::Succeeded)
    }

    /// An already failed completion
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::with_state(CompletionState::Failed(reason.into()))
    }

    /// True once the task finished, successfully or not
    pub fn is_complete(&self) -> bool {
        !matches!(*self.inner.state.lock(), CompletionState::Pending)
    }

    /// Block until the task finished
    pub fn wait(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        while matches!(*state, CompletionState::Pending) {
            self.inner.cond.wait(&mut state);
        }
        Self::outcome(&state)
    }

    /// Block for at most `timeout`; `None` if the task is still running
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let mut state = self.inner.state.lock();
        if matches!(*state, CompletionState::Pending) {
            let _ = self
                .inner
                .cond
                .wait_while_for(&mut state, |s| matches!(s, CompletionState::Pending), timeout);
        }
        match *state {
            CompletionState::Pending => None,
            _ => Some(Self::outcome(&state)),
        }
    }

    fn outcome(state: &CompletionState) -> Result<()> {
        match state {
            CompletionState::Failed(reason) => Err(Error::Background(reason.clone())),
            _ => Ok(()),
        }
    }
}

impl Completer {
    /// Report the task's outcome and wake all waiters
    pub fn complete(mut self, outcome: Result<()>) {
        if let Some(inner) = self.inner.take() {
            Self::publish(&inner, outcome.map_err(|e| e.to_string()));
        }
    }

    fn publish(inner: &CompletionInner, outcome: std::result::Result<(), String>) {
        let mut state = inner.state.lock();
        *state = match outcome {
            Ok(()) => CompletionState::Succeeded,
            Err(reason) => CompletionState::Failed(reason),
        };
        inner.cond.notify_all();
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            Self::publish(&inner, Err("task dropped before completion".to_string()));
        }
    }
}
