//! Store façade
//!
//! A [`Store`] coordinates the record file, its TOC, the per-entity locks and
//! the entity codec. Every keyed operation runs inside the store gate in
//! shared mode and holds the entity's lock while it touches the file;
//! [`Store::shrink`] takes the gate exclusively.
//!
//! ## TOC readiness
//!
//! A store opened on a file without a usable persisted TOC rebuilds it on a
//! worker thread. Until then:
//! - `get`, `update`, `delete` proceed at once and only wait if the key is
//!   not in the TOC yet
//! - `add`, relocating updates, queries and `shrink` wait for the rebuild,
//!   since they need to know the whole file
//!
//! ## Thread Safety
//!
//! `Store` is `Send + Sync`; share it by reference or behind an `Arc`.

mod config;
mod shrink;

pub use config::{Durability, StoreConfig, CONFIG_FILE_NAME, DEFAULT_MATERIALIZE_THRESHOLD};
pub use shrink::ShrinkReport;

use crate::background::{BackgroundScheduler, SchedulerStats, DEFAULT_QUEUE_DEPTH};
use crate::codec::{EntityCodec, MessagePackCodec};
use crate::index::SecondaryIndex;
use crate::query::Query;
use parking_lot::RwLock;
use rackdb_concurrency::{Acquire, CancellationToken, EntityLockManager, SharedGuard, StoreGate};
use rackdb_core::{Completion, EntityKey, Error, InlineScheduler, Result};
use rackdb_storage::{
    RecordMeta, RecordStore, RecordStoreOptions, Toc, TocEntry, HEADER_SIZE,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Interval at which bounded TOC-readiness waits re-check their limits
const READY_POLL: Duration = Duration::from_millis(10);

/// Outcome of an operation with a bounded lock wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    /// The operation ran
    Done(T),
    /// A lock (or the TOC) was not available in time; nothing happened
    TimedOut,
}

impl<T> Attempt<T> {
    /// The result, if the operation ran
    pub fn done(self) -> Option<T> {
        match self {
            Attempt::Done(value) => Some(value),
            Attempt::TimedOut => None,
        }
    }

    /// True if the wait ran out
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Attempt::TimedOut)
    }
}

/// Store counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Live entities
    pub live: usize,
    /// Deleted entities whose slots await shrink or reuse
    pub free: usize,
    /// Orphaned slots left by relocating updates
    pub retired: usize,
    /// Bytes held by live slots, headers included
    pub live_bytes: u64,
    /// Bytes shrink would give back
    pub reclaimable_bytes: u64,
    /// End of the record region
    pub data_end: u64,
    /// Physical file length, persisted TOC included
    pub file_len: u64,
    /// TOC reflects the whole file
    pub toc_ready: bool,
    /// File currently ends with a persisted TOC
    pub sealed: bool,
}

/// Unwrap a bounded wait or report the timeout to the caller.
macro_rules! within {
    ($wait:expr) => {
        match $wait {
            Some(value) => value,
            None => return Ok(Attempt::TimedOut),
        }
    };
}

/// Embedded single-file entity store
pub struct Store<C: EntityCodec = MessagePackCodec> {
    path: PathBuf,
    config: StoreConfig,
    records: Arc<RecordStore>,
    toc: Arc<Toc>,
    ready: Completion,
    locks: EntityLockManager,
    gate: StoreGate,
    codec: C,
    indexes: RwLock<Vec<Arc<dyn SecondaryIndex>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    // Declared last: dropping it joins a rebuild that may still use the fields above.
    scheduler: Option<BackgroundScheduler>,
}

impl Store<MessagePackCodec> {
    /// Open or create the store at `path` with the default configuration
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, StoreConfig::default())
    }

    /// Open or create the store at `path`
    pub fn open_with_config(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        Self::open_with_codec(path, config, MessagePackCodec)
    }
}

impl<C: EntityCodec> Store<C> {
    /// Open or create the store at `path` using `codec` for entities
    ///
    /// Returns as soon as the file is open. If no valid persisted TOC is
    /// found and `background_rebuild` is set, the TOC is rebuilt on a
    /// worker thread; [`Store::wait_ready`] blocks until it is done.
    ///
    /// # Errors
    ///
    /// - `Config` for an invalid configuration
    /// - `Io` if the file cannot be opened
    /// - `Background` if a synchronous rebuild fails
    pub fn open_with_codec(path: impl AsRef<Path>, config: StoreConfig, codec: C) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        let options = RecordStoreOptions {
            sync_writes: config.durability_mode()? == Durability::Always,
        };
        let records = Arc::new(RecordStore::open(&path, options)?);

        let scheduler = if config.background_rebuild {
            Some(BackgroundScheduler::new(
                config.scheduler_threads,
                DEFAULT_QUEUE_DEPTH,
            )?)
        } else {
            None
        };
        let (toc, ready) = match &scheduler {
            Some(scheduler) => Toc::create(&records, scheduler)?,
            None => {
                let (toc, ready) = Toc::create(&records, &InlineScheduler)?;
                ready.wait()?;
                (toc, ready)
            }
        };

        info!(
            path = %path.display(),
            codec = codec.codec_id(),
            toc_ready = toc.is_ready(),
            entries = toc.len(),
            "opened store"
        );

        Ok(Store {
            path,
            config,
            records,
            toc,
            ready,
            locks: EntityLockManager::new(),
            gate: StoreGate::new(),
            codec,
            indexes: RwLock::new(Vec::new()),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            scheduler,
        })
    }

    /// Path of the record file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configuration the store was opened with
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Token cancelled by [`Store::close`]; pass it to bounded waits to
    /// have them abort when the store shuts down
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Block until the TOC reflects the whole file
    ///
    /// # Errors
    ///
    /// `Background` if the rebuild failed (for example on a corrupt file).
    pub fn wait_ready(&self) -> Result<()> {
        self.ready.wait()
    }

    /// True once the TOC reflects the whole file
    pub fn is_ready(&self) -> bool {
        self.toc.is_ready()
    }

    // ========================================================================
    // Keyed operations
    // ========================================================================

    /// Store a new entity and return its freshly generated key
    ///
    /// The payload goes into the best-fitting free slot if one is large
    /// enough, otherwise at the end of the file.
    pub fn add<T: Serialize>(&self, entity: &T) -> Result<EntityKey> {
        let _gate = self.enter_gate(&self.unbounded())?;
        self.wait_ready()?;

        let payload = self.codec.encode(entity)?;
        let document = self.document_for_indexes(entity)?;
        let key = EntityKey::new();
        let version = self.toc.allocate_version();

        let entry = self.write_new_slot(key, version, &payload)?;
        self.toc.upsert_entry(entry);
        if let Some(document) = document {
            self.indexes.read().iter().for_each(|i| i.on_upsert(key, &document));
        }
        Ok(key)
    }

    /// Fetch the entity stored under `key`
    ///
    /// `Ok(None)` if the key is unknown or deleted.
    pub fn get<T: DeserializeOwned>(&self, key: &EntityKey) -> Result<Option<T>> {
        self.get_inner(key, &self.unbounded())?
            .done()
            .ok_or_else(|| Error::ConcurrencyViolation("unbounded wait timed out".to_string()))
    }

    /// [`Store::get`] with a bounded lock wait
    ///
    /// Without a timeout in `acquire`, the configured `lock_timeout_ms`
    /// applies.
    pub fn get_with<T: DeserializeOwned>(
        &self,
        key: &EntityKey,
        acquire: &Acquire,
    ) -> Result<Attempt<Option<T>>> {
        self.get_inner(key, &self.effective(acquire))
    }

    /// Replace the entity stored under `key`
    ///
    /// A payload that fits the slot is rewritten in place; a larger one is
    /// written to a new slot and the old slot is retired.
    ///
    /// # Errors
    ///
    /// `EntityNotFound` if the key is unknown or deleted.
    pub fn update<T: Serialize>(&self, key: &EntityKey, entity: &T) -> Result<()> {
        self.update_inner(key, entity, &self.unbounded())?
            .done()
            .ok_or_else(|| Error::ConcurrencyViolation("unbounded wait timed out".to_string()))
    }

    /// [`Store::update`] with a bounded lock wait
    pub fn update_with<T: Serialize>(
        &self,
        key: &EntityKey,
        entity: &T,
        acquire: &Acquire,
    ) -> Result<Attempt<()>> {
        self.update_inner(key, entity, &self.effective(acquire))
    }

    /// Delete the entity stored under `key`
    ///
    /// The slot is tombstoned and kept until shrink or reuse.
    ///
    /// # Errors
    ///
    /// `EntityNotFound` if the key is unknown or already deleted.
    pub fn delete(&self, key: &EntityKey) -> Result<()> {
        self.delete_inner(key, &self.unbounded())?
            .done()
            .ok_or_else(|| Error::ConcurrencyViolation("unbounded wait timed out".to_string()))
    }

    /// [`Store::delete`] with a bounded lock wait
    pub fn delete_with(&self, key: &EntityKey, acquire: &Acquire) -> Result<Attempt<()>> {
        self.delete_inner(key, &self.effective(acquire))
    }

    /// True if `key` names a live entity
    pub fn contains(&self, key: &EntityKey) -> Result<bool> {
        let acquire = self.unbounded();
        let _gate = self.enter_gate(&acquire)?;
        Ok(matches!(
            self.lookup_live(key, &acquire)?,
            Attempt::Done(Some(_))
        ))
    }

    /// Number of live entities
    pub fn len(&self) -> Result<usize> {
        self.wait_ready()?;
        Ok(self.toc.stats().live)
    }

    /// True if no live entity exists
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Keys of all live entities in file order
    pub fn keys(&self) -> Result<Vec<EntityKey>> {
        self.wait_ready()?;
        Ok(self.toc.active_entries().iter().map(|e| e.key).collect())
    }

    /// Start a query over entities of type `T`
    pub fn query<T>(&self) -> Query<'_, T, C>
    where
        T: Serialize + DeserializeOwned,
    {
        Query::new(self)
    }

    // ========================================================================
    // Indexes
    // ========================================================================

    /// Attach a secondary index
    ///
    /// The index is maintained from now on; call [`Store::reindex`] to load
    /// entities that already exist.
    pub fn attach_index(&self, index: Arc<dyn SecondaryIndex>) {
        debug!(paths = ?index.indexed_paths(), "attached secondary index");
        self.indexes.write().push(index);
    }

    /// Rebuild every attached index from the live entities of type `T`
    ///
    /// Returns the number of entities indexed.
    pub fn reindex<T>(&self) -> Result<usize>
    where
        T: Serialize + DeserializeOwned,
    {
        self.wait_ready()?;
        let indexes: Vec<Arc<dyn SecondaryIndex>> = self.indexes.read().clone();
        indexes.iter().for_each(|i| i.clear());

        let mut indexed = 0;
        for entry in self.toc.active_entries() {
            if let Some((key, entity)) = self.decode_entry::<T>(entry.key)? {
                let document = serde_json::to_value(&entity)?;
                indexes.iter().for_each(|i| i.on_upsert(key, &document));
                indexed += 1;
            }
        }
        info!(indexed, indexes = indexes.len(), "rebuilt secondary indexes");
        Ok(indexed)
    }

    pub(crate) fn indexes(&self) -> Vec<Arc<dyn SecondaryIndex>> {
        self.indexes.read().clone()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Persist the TOC into the file so the next open needs no scan
    ///
    /// Waits for in-flight operations to finish first.
    pub fn checkpoint(&self) -> Result<()> {
        let _exclusive = self
            .gate
            .enter_exclusive(&self.unbounded())?
            .ok_or(Error::Closed)?;
        self.ensure_open()?;
        self.wait_ready()?;
        let toc_offset = self.toc.persist(&self.records)?;
        info!(toc_offset, entries = self.toc.len(), "checkpointed TOC");
        Ok(())
    }

    /// Close the store
    ///
    /// Waits for in-flight operations, persists the TOC if configured, syncs
    /// the file and rejects every later call with `Closed`. Closing twice
    /// is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let exclusive = self.gate.enter_exclusive(&Acquire::unbounded())?;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.gate.close();
        self.locks.close();
        self.cancel.cancel();

        let outcome = self.flush_on_close();
        drop(exclusive);
        info!(path = %self.path.display(), "closed store");
        outcome
    }

    fn flush_on_close(&self) -> Result<()> {
        if self.config.persist_toc_on_close {
            match self.ready.wait() {
                Ok(()) => {
                    self.toc.persist(&self.records)?;
                }
                Err(e) => warn!(error = %e, "TOC never became ready; not persisting it"),
            }
        }
        self.records.sync()
    }

    /// Store counters
    pub fn stats(&self) -> Result<StoreStats> {
        let toc = self.toc.stats();
        Ok(StoreStats {
            live: toc.live,
            free: toc.free,
            retired: toc.retired,
            live_bytes: toc.live_bytes,
            reclaimable_bytes: toc.reclaimable_bytes,
            data_end: self.records.end(),
            file_len: self.records.file_len()?,
            toc_ready: self.toc.is_ready(),
            sealed: self.records.is_sealed(),
        })
    }

    /// Counters of the background scheduler, if the store runs one
    pub fn scheduler_stats(&self) -> Option<SchedulerStats> {
        self.scheduler.as_ref().map(BackgroundScheduler::stats)
    }

    /// Keys currently holding or awaiting an entity lock
    pub fn contended_keys(&self) -> usize {
        self.locks.contended_keys()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn get_inner<T: DeserializeOwned>(
        &self,
        key: &EntityKey,
        acquire: &Acquire,
    ) -> Result<Attempt<Option<T>>> {
        let _gate = within!(self.try_enter_gate(acquire)?);
        let guard = within!(self.locks.try_enter_read(*key, acquire)?);
        let entry = match within!(self.lookup_live(key, acquire)?.done()) {
            Some(entry) => entry,
            None => return Ok(Attempt::Done(None)),
        };
        let entity = self.read_entity(&entry)?;
        guard.release()?;
        Ok(Attempt::Done(Some(entity)))
    }

    fn update_inner<T: Serialize>(
        &self,
        key: &EntityKey,
        entity: &T,
        acquire: &Acquire,
    ) -> Result<Attempt<()>> {
        let _gate = within!(self.try_enter_gate(acquire)?);
        let guard = within!(self.locks.try_enter_write(*key, acquire)?);
        let entry = within!(self.lookup_live(key, acquire)?.done()).ok_or(Error::EntityNotFound(*key))?;

        let payload = self.codec.encode(entity)?;
        let document = self.document_for_indexes(entity)?;

        if payload.len() as u64 <= entry.capacity() {
            let version = self.toc.allocate_version();
            self.records.write_payload(
                entry.offset,
                RecordMeta::new(*key, version),
                &payload,
                entry.capacity() as usize,
            )?;
            self.toc.upsert_entry(TocEntry { version, ..entry });
        } else {
            // A new slot needs the complete free-space picture.
            if !self.await_ready(acquire)? {
                return Ok(Attempt::TimedOut);
            }
            let version = self.toc.allocate_version();
            let moved = self.write_new_slot(*key, version, &payload)?;
            self.toc.upsert_entry(moved);
            self.records.mark_as_not_used(entry.offset)?;
            self.toc.retire(entry);
            debug!(
                %key,
                from = entry.offset,
                to = moved.offset,
                bytes = payload.len(),
                "relocated record"
            );
        }

        if let Some(document) = document {
            self.indexes.read().iter().for_each(|i| i.on_upsert(*key, &document));
        }
        guard.release()?;
        Ok(Attempt::Done(()))
    }

    fn delete_inner(&self, key: &EntityKey, acquire: &Acquire) -> Result<Attempt<()>> {
        let _gate = within!(self.try_enter_gate(acquire)?);
        let guard = within!(self.locks.try_enter_write(*key, acquire)?);
        let entry = within!(self.lookup_live(key, acquire)?.done()).ok_or(Error::EntityNotFound(*key))?;

        self.records.mark_as_not_used(entry.offset)?;
        self.toc.mark_free(key);
        self.indexes.read().iter().for_each(|i| i.on_remove(key));
        guard.release()?;
        Ok(Attempt::Done(()))
    }

    /// Live TOC entry for `key`, waiting for the rebuild only on a miss
    fn lookup_live(&self, key: &EntityKey, acquire: &Acquire) -> Result<Attempt<Option<TocEntry>>> {
        if key.is_reserved() {
            return Ok(Attempt::Done(None));
        }
        let mut entry = self.toc.try_get_entry(key);
        if entry.is_none() && !self.toc.is_ready() {
            if !self.await_ready(acquire)? {
                return Ok(Attempt::TimedOut);
            }
            entry = self.toc.try_get_entry(key);
        }
        Ok(Attempt::Done(entry.filter(|e| !e.is_free)))
    }

    /// Read and decode `key` under its read lock; `None` if it vanished
    pub(crate) fn decode_entry<T: DeserializeOwned>(
        &self,
        key: EntityKey,
    ) -> Result<Option<(EntityKey, T)>> {
        let acquire = self.unbounded();
        let _gate = self.enter_gate(&acquire)?;
        let guard = self.locks.enter_read(key)?;
        let entity = match self.toc.try_get_entry(&key) {
            Some(entry) if !entry.is_free => Some((key, self.read_entity(&entry)?)),
            _ => None,
        };
        guard.release()?;
        Ok(entity)
    }

    fn read_entity<T: DeserializeOwned>(&self, entry: &TocEntry) -> Result<T> {
        let (header, reader) = self.records.read(entry.offset)?;
        if header.key != entry.key || !header.in_use {
            return Err(Error::corruption(
                entry.offset,
                format!("TOC points {} at a slot holding {}", entry.key, header.key),
            ));
        }
        self.codec.decode(&reader.into_payload())
    }

    /// Write `payload` into a reused free slot or a fresh one at the end
    fn write_new_slot(&self, key: EntityKey, version: u32, payload: &[u8]) -> Result<TocEntry> {
        let slot_size = (HEADER_SIZE + payload.len()) as u64;
        let (offset, size) = match self.toc.take_free_slot(slot_size) {
            Some(slot) => (slot.offset, slot.size),
            None => (self.records.reserve(slot_size)?, slot_size),
        };
        let capacity = (size - HEADER_SIZE as u64) as usize;
        if let Err(e) =
            self.records
                .write_payload(offset, RecordMeta::new(key, version), payload, capacity)
        {
            // The slot still holds a tombstone; hand it back for reuse.
            self.toc.retire(TocEntry {
                key: EntityKey::RESERVED,
                offset,
                size,
                is_free: true,
                version: 0,
            });
            return Err(e);
        }
        Ok(TocEntry {
            key,
            offset,
            size,
            is_free: false,
            version,
        })
    }

    fn document_for_indexes<T: Serialize>(&self, entity: &T) -> Result<Option<serde_json::Value>> {
        if self.indexes.read().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::to_value(entity)?))
    }

    /// Wait for the TOC under `acquire`'s limits; `Ok(false)` on timeout
    pub(crate) fn await_ready(&self, acquire: &Acquire) -> Result<bool> {
        if self.toc.is_ready() {
            return Ok(true);
        }
        let deadline = acquire.timeout.map(|t| Instant::now() + t);
        loop {
            if acquire.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
                return Err(Error::Cancelled);
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    (deadline - now).min(READY_POLL)
                }
                None => READY_POLL,
            };
            if let Some(outcome) = self.ready.wait_timeout(slice) {
                outcome?;
                return Ok(true);
            }
        }
    }

    fn enter_gate(&self, acquire: &Acquire) -> Result<SharedGuard<'_>> {
        self.try_enter_gate(acquire)?.ok_or(Error::Closed)
    }

    fn try_enter_gate(&self, acquire: &Acquire) -> Result<Option<SharedGuard<'_>>> {
        let guard = self.gate.enter_shared(acquire)?;
        self.ensure_open()?;
        Ok(guard)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn unbounded(&self) -> Acquire {
        Acquire::unbounded().with_cancel(self.cancel.clone())
    }

    /// Fill in the configured timeout and the store's cancellation token
    fn effective(&self, acquire: &Acquire) -> Acquire {
        Acquire {
            timeout: acquire.timeout.or_else(|| self.config.lock_timeout()),
            cancel: acquire.cancel.clone().or_else(|| Some(self.cancel.clone())),
        }
    }

    pub(crate) fn toc(&self) -> &Toc {
        &self.toc
    }
}

impl<C: EntityCodec> Drop for Store<C> {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            if let Err(e) = self.close() {
                warn!(error = %e, "failed to close store on drop");
            }
        }
    }
}
