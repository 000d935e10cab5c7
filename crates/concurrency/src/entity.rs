//! Per-entity lock manager
//!
//! Each key gets its own [`SharedExclusive`] on first use. The slot is
//! reference counted by the holders and waiters of that key; when the last
//! one leaves, the slot is evicted so the map only ever holds contended
//! keys.
//!
//! The refcount is only changed while the map shard holding the key is
//! write-locked: increments inside `entry()`, decrements inside the
//! `remove_if` predicate. A slot therefore cannot be evicted between a
//! renter finding it and bumping its count.

use crate::acquire::Acquire;
use crate::primitive::SharedExclusive;
use dashmap::DashMap;
use rackdb_core::{EntityKey, Error, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Default)]
struct LockSlot {
    refs: AtomicUsize,
    lock: SharedExclusive,
}

/// Keyed read/write locks for entities
#[derive(Debug, Default)]
pub struct EntityLockManager {
    slots: DashMap<EntityKey, Arc<LockSlot>>,
    closed: AtomicBool,
}

impl EntityLockManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter `key` for reading, waiting as long as needed
    pub fn enter_read(&self, key: EntityKey) -> Result<EntityReadGuard<'_>> {
        self.try_enter_read(key, &Acquire::unbounded())?
            .ok_or_else(|| Error::ConcurrencyViolation("unbounded read wait gave up".to_string()))
    }

    /// Enter `key` for writing, waiting as long as needed
    pub fn enter_write(&self, key: EntityKey) -> Result<EntityWriteGuard<'_>> {
        self.try_enter_write(key, &Acquire::unbounded())?
            .ok_or_else(|| Error::ConcurrencyViolation("unbounded write wait gave up".to_string()))
    }

    /// Enter `key` for reading under `acquire`
    ///
    /// `Ok(None)` if the wait timed out.
    pub fn try_enter_read(
        &self,
        key: EntityKey,
        acquire: &Acquire,
    ) -> Result<Option<EntityReadGuard<'_>>> {
        let slot = self.rent(key)?;
        match slot.lock.acquire_shared(acquire) {
            Ok(true) => Ok(Some(EntityReadGuard {
                manager: self,
                key,
                slot: Some(slot),
            })),
            other => {
                self.give_back(&key);
                other.map(|_| None)
            }
        }
    }

    /// Enter `key` for writing under `acquire`
    ///
    /// `Ok(None)` if the wait timed out.
    pub fn try_enter_write(
        &self,
        key: EntityKey,
        acquire: &Acquire,
    ) -> Result<Option<EntityWriteGuard<'_>>> {
        let slot = self.rent(key)?;
        match slot.lock.acquire_exclusive(acquire) {
            Ok(true) => Ok(Some(EntityWriteGuard {
                manager: self,
                key,
                slot: Some(slot),
            })),
            other => {
                self.give_back(&key);
                other.map(|_| None)
            }
        }
    }

    /// Number of keys that currently have holders or waiters
    pub fn contended_keys(&self) -> usize {
        self.slots.len()
    }

    /// Refuse new acquisitions; existing guards stay valid
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// True after [`EntityLockManager::close`]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn rent(&self, key: EntityKey) -> Result<Arc<LockSlot>> {
        if self.is_closed() {
            return Err(Error::ConcurrencyViolation(
                "entity lock manager is closed".to_string(),
            ));
        }
        let entry = self.slots.entry(key).or_default();
        entry.refs.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(entry.value()))
    }

    fn give_back(&self, key: &EntityKey) {
        let evicted = self
            .slots
            .remove_if(key, |_, slot| slot.refs.fetch_sub(1, Ordering::SeqCst) == 1);
        if evicted.is_some() {
            trace!(%key, "evicted entity lock slot");
        }
    }
}

/// Shared hold on one entity
#[derive(Debug)]
pub struct EntityReadGuard<'a> {
    manager: &'a EntityLockManager,
    key: EntityKey,
    slot: Option<Arc<LockSlot>>,
}

impl EntityReadGuard<'_> {
    /// Key this guard protects
    pub fn key(&self) -> EntityKey {
        self.key
    }

    /// Release the hold now
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        let slot = self.slot.take().ok_or_else(|| {
            Error::ConcurrencyViolation(format!("read guard for {} already released", self.key))
        })?;
        let outcome = slot.lock.release_shared();
        drop(slot);
        self.manager.give_back(&self.key);
        outcome
    }
}

impl Drop for EntityReadGuard<'_> {
    fn drop(&mut self) {
        if self.slot.is_some() {
            let _ = self.release_inner();
        }
    }
}

/// Exclusive hold on one entity
#[derive(Debug)]
pub struct EntityWriteGuard<'a> {
    manager: &'a EntityLockManager,
    key: EntityKey,
    slot: Option<Arc<LockSlot>>,
}

impl EntityWriteGuard<'_> {
    /// Key this guard protects
    pub fn key(&self) -> EntityKey {
        self.key
    }

    /// Release the hold now
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        let slot = self.slot.take().ok_or_else(|| {
            Error::ConcurrencyViolation(format!("write guard for {} already released", self.key))
        })?;
        let outcome = slot.lock.release_exclusive();
        drop(slot);
        self.manager.give_back(&self.key);
        outcome
    }
}

impl Drop for EntityWriteGuard<'_> {
    fn drop(&mut self) {
        if self.slot.is_some() {
            let _ = self.release_inner();
        }
    }
}
