//! Store-wide shared/exclusive mode
//!
//! Every keyed operation runs inside the gate in shared mode. Shrink takes
//! it exclusively: it waits for in-flight operations to drain, and nothing
//! new starts until it is done.

use crate::acquire::Acquire;
use crate::primitive::SharedExclusive;
use rackdb_core::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};

/// Store-wide mode switch
#[derive(Debug, Default)]
pub struct StoreGate {
    lock: SharedExclusive,
    closed: AtomicBool,
}

impl StoreGate {
    /// Create an open gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter in shared mode; `Ok(None)` if the wait timed out
    pub fn enter_shared(&self, acquire: &Acquire) -> Result<Option<SharedGuard<'_>>> {
        self.check_open()?;
        Ok(self
            .lock
            .acquire_shared(acquire)?
            .then_some(SharedGuard { gate: self }))
    }

    /// Enter in exclusive mode; `Ok(None)` if the wait timed out
    pub fn enter_exclusive(&self, acquire: &Acquire) -> Result<Option<ExclusiveGuard<'_>>> {
        self.check_open()?;
        Ok(self
            .lock
            .acquire_exclusive(acquire)?
            .then_some(ExclusiveGuard { gate: self }))
    }

    /// Refuse new entries; existing guards stay valid
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// True after [`StoreGate::close`]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }
}

/// Shared hold on the store
#[derive(Debug)]
pub struct SharedGuard<'a> {
    gate: &'a StoreGate,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        let _ = self.gate.lock.release_shared();
    }
}

/// Exclusive hold on the store
#[derive(Debug)]
pub struct ExclusiveGuard<'a> {
    gate: &'a StoreGate,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        let _ = self.gate.lock.release_exclusive();
    }
}
