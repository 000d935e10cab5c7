//! Table of contents: key → slot location
//!
//! The TOC is a cache, not a source of truth. Every entry can be derived
//! by scanning the record file from front to back, which is what happens
//! when a file is opened without a valid persisted TOC.
//!
//! # Entries
//!
//! - live entry: key is addressable, slot holds the current payload
//! - free entry: key was deleted, slot kept until shrink or reuse
//! - retired slot: a slot no key points to any more (left behind by a
//!   relocating update); reusable and reclaimed by shrink
//!
//! # Rebuild races
//!
//! A background rebuild runs while callers may already update and delete
//! by key. Entries carry the record version; a scanned header only
//! replaces an entry with a strictly older version, so a slow scan never
//! resurrects a deleted key or rolls back an update.

use crate::format::{RecordMeta, HEADER_SIZE};
use crate::record_store::{RecordStore, ScanSummary};
use parking_lot::{Mutex, RwLock};
use rackdb_core::{Completer, Completion, EntityKey, Error, Result, Scheduler};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Version of the persisted TOC payload
pub const TOC_FORMAT_VERSION: u32 = 1;

/// Location of one record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocEntry {
    /// Entity key
    pub key: EntityKey,
    /// Offset of the record header
    pub offset: u64,
    /// Slot size in bytes, header included
    pub size: u64,
    /// True once deleted
    pub is_free: bool,
    /// Version of the last write to the slot
    pub version: u32,
}

impl TocEntry {
    /// Payload bytes the slot can hold
    pub fn capacity(&self) -> u64 {
        self.size.saturating_sub(HEADER_SIZE as u64)
    }

    /// Offset just past the slot
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Counters describing the TOC contents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TocStats {
    /// Live entries
    pub live: usize,
    /// Deleted entries awaiting shrink
    pub free: usize,
    /// Orphaned slots awaiting shrink
    pub retired: usize,
    /// Bytes held by live slots
    pub live_bytes: u64,
    /// Bytes held by free and retired slots
    pub reclaimable_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct TocSnapshot {
    format_version: u32,
    data_end: u64,
    next_version: u32,
    entries: Vec<TocEntry>,
    retired: Vec<TocEntry>,
}

#[derive(Debug, Default)]
struct TocState {
    entries: HashMap<EntityKey, TocEntry>,
    /// Orphaned slots keyed by offset
    retired: BTreeMap<u64, TocEntry>,
}

impl TocState {
    fn merge_scanned(&mut self, scanned: TocEntry) {
        if scanned.key.is_reserved() {
            // A TOC record inside the data region is dead weight.
            self.retire(scanned);
            return;
        }
        match self.entries.get(&scanned.key).copied() {
            None => {
                self.entries.insert(scanned.key, scanned);
            }
            Some(existing) if existing.offset == scanned.offset => {}
            Some(existing) if scanned.version > existing.version => {
                self.entries.insert(scanned.key, scanned);
                self.retire(existing);
            }
            Some(_) => self.retire(scanned),
        }
    }

    fn retire(&mut self, entry: TocEntry) {
        self.retired.insert(
            entry.offset,
            TocEntry {
                is_free: true,
                ..entry
            },
        );
    }
}

/// In-memory index from key to record location
pub struct Toc {
    state: RwLock<TocState>,
    next_version: AtomicU32,
    ready: AtomicBool,
    ready_signal: Completion,
    completer: Mutex<Option<Completer>>,
}

impl Toc {
    fn new_pending() -> Self {
        let (ready_signal, completer) = Completion::pending();
        Toc {
            state: RwLock::new(TocState::default()),
            next_version: AtomicU32::new(1),
            ready: AtomicBool::new(false),
            ready_signal,
            completer: Mutex::new(Some(completer)),
        }
    }

    /// An empty TOC that is immediately ready
    pub fn empty() -> Arc<Self> {
        let toc = Self::new_pending();
        toc.finish(Ok(()));
        Arc::new(toc)
    }

    /// Load the persisted TOC or schedule a rebuild scan
    ///
    /// Returns at once. The returned [`Completion`] finishes when the TOC
    /// reflects the whole file; until then lookups may miss keys that
    /// exist on disk.
    pub fn create(
        store: &Arc<RecordStore>,
        scheduler: &dyn Scheduler,
    ) -> Result<(Arc<Toc>, Completion)> {
        let toc = Arc::new(Self::new_pending());

        match toc.load_persisted(store) {
            Ok(true) => {
                toc.finish(Ok(()));
                return Ok((Arc::clone(&toc), toc.ready_signal.clone()));
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "persisted TOC is unusable; rebuilding by scan"),
        }

        let limit = store.end();
        let task_toc = Arc::clone(&toc);
        let task_store = Arc::clone(store);
        // The scheduler's own completion is not needed: the task reports
        // through the TOC's completer, which also fires if the task is dropped.
        let _ = scheduler.schedule(Box::new(move || {
            let outcome = task_toc.rebuild(&task_store, limit).map(|_| ());
            if let Err(e) = &outcome {
                error!(error = %e, "TOC rebuild failed");
            }
            let reported = outcome.as_ref().map(|_| ()).map_err(|e| Error::Background(e.to_string()));
            task_toc.finish(reported);
            outcome
        }));

        Ok((Arc::clone(&toc), toc.ready_signal.clone()))
    }

    /// Scan `[0, limit)` and merge every header into the TOC
    ///
    /// A torn tail is truncated away.
    pub fn rebuild(&self, store: &RecordStore, limit: u64) -> Result<ScanSummary> {
        let mut max_version = 0u32;
        let summary = store.read_range(0, limit, |offset, header| {
            max_version = max_version.max(header.version);
            self.state.write().merge_scanned(TocEntry {
                key: header.key,
                offset,
                size: header.slot_size(),
                is_free: !header.in_use,
                version: header.version,
            });
            Ok(())
        })?;
        self.observe_version(max_version);

        if summary.torn_tail {
            warn!(
                valid_end = summary.end,
                limit, "torn record at end of file; truncating"
            );
            store.truncate(summary.end)?;
        }

        info!(
            records = summary.records,
            live = summary.live,
            end = summary.end,
            "rebuilt TOC from record scan"
        );
        Ok(summary)
    }

    fn load_persisted(&self, store: &RecordStore) -> Result<bool> {
        let footer = match store.read_footer()? {
            Some(footer) => footer,
            None => return Ok(false),
        };
        let (header, reader) = store.read_sealed(footer.toc_offset)?;
        if !header.key.is_reserved() || !header.in_use {
            return Err(Error::corruption(
                footer.toc_offset,
                "footer does not point at a TOC record",
            ));
        }
        let snapshot: TocSnapshot = rmp_serde::from_slice(&reader.into_payload())?;
        if snapshot.format_version != TOC_FORMAT_VERSION {
            return Err(Error::corruption(
                footer.toc_offset,
                format!("unsupported TOC format {}", snapshot.format_version),
            ));
        }
        if snapshot.data_end != footer.toc_offset {
            return Err(Error::corruption(
                footer.toc_offset,
                format!(
                    "TOC describes {} bytes but the data region is {} bytes",
                    snapshot.data_end, footer.toc_offset
                ),
            ));
        }

        {
            let mut state = self.state.write();
            state.entries = snapshot.entries.into_iter().map(|e| (e.key, e)).collect();
            state.retired = snapshot.retired.into_iter().map(|e| (e.offset, e)).collect();
        }
        self.next_version.fetch_max(snapshot.next_version, Ordering::SeqCst);
        store.adopt_seal(footer.toc_offset);

        info!(
            toc_offset = footer.toc_offset,
            entries = self.len(),
            "loaded persisted TOC"
        );
        Ok(true)
    }

    /// Write the entry set as the reserved key-zero record
    ///
    /// # Errors
    ///
    /// `ConcurrencyViolation` if the TOC is not ready yet.
    pub fn persist(&self, store: &RecordStore) -> Result<u64> {
        if !self.is_ready() {
            return Err(Error::ConcurrencyViolation(
                "cannot persist a TOC that is still being rebuilt".to_string(),
            ));
        }
        let snapshot = {
            let state = self.state.read();
            let mut entries: Vec<TocEntry> = state.entries.values().copied().collect();
            entries.sort_by_key(|e| e.offset);
            TocSnapshot {
                format_version: TOC_FORMAT_VERSION,
                data_end: store.end(),
                next_version: self.next_version.load(Ordering::SeqCst),
                entries,
                retired: state.retired.values().copied().collect(),
            }
        };
        let payload = rmp_serde::to_vec(&snapshot)?;
        store.seal(
            RecordMeta::new(EntityKey::RESERVED, snapshot.next_version),
            &payload,
        )
    }

    fn finish(&self, outcome: Result<()>) {
        if outcome.is_ok() {
            self.ready.store(true, Ordering::SeqCst);
        }
        if let Some(completer) = self.completer.lock().take() {
            completer.complete(outcome);
        }
    }

    /// True once the TOC reflects the whole file
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Handle that completes when the TOC is ready
    pub fn ready_signal(&self) -> Completion {
        self.ready_signal.clone()
    }

    /// Insert or replace the entry for `key`
    pub fn upsert(&self, key: EntityKey, offset: u64, size: u64, is_free: bool) {
        let version = self
            .try_get_entry(&key)
            .map(|e| e.version)
            .unwrap_or_default();
        self.upsert_entry(TocEntry {
            key,
            offset,
            size,
            is_free,
            version,
        });
    }

    /// Insert or replace an entry
    pub fn upsert_entry(&self, entry: TocEntry) {
        if entry.key.is_reserved() {
            return;
        }
        self.observe_version(entry.version);
        self.state.write().entries.insert(entry.key, entry);
    }

    /// Merge an entry only if it is newer than what the TOC holds
    pub fn upsert_if_newer(&self, entry: TocEntry) {
        self.observe_version(entry.version);
        self.state.write().merge_scanned(entry);
    }

    /// Look up the entry for `key`, free or not
    pub fn try_get_entry(&self, key: &EntityKey) -> Option<TocEntry> {
        self.state.read().entries.get(key).copied()
    }

    /// Remove the entry for `key`
    pub fn remove(&self, key: &EntityKey) -> Option<TocEntry> {
        self.state.write().entries.remove(key)
    }

    /// Mark the entry for `key` free; returns the updated entry
    pub fn mark_free(&self, key: &EntityKey) -> Option<TocEntry> {
        let mut state = self.state.write();
        let entry = state.entries.get_mut(key)?;
        entry.is_free = true;
        Some(*entry)
    }

    /// Keep an orphaned slot until it is reused or reclaimed
    pub fn retire(&self, entry: TocEntry) {
        self.state.write().retire(entry);
    }

    /// Claim the smallest free or retired slot of at least `min_size` bytes
    ///
    /// Returns `None` while the TOC is not ready: free space is only known
    /// once the whole file has been scanned.
    pub fn take_free_slot(&self, min_size: u64) -> Option<TocEntry> {
        if !self.is_ready() {
            return None;
        }
        let mut state = self.state.write();

        let from_free = state
            .entries
            .values()
            .filter(|e| e.is_free && e.size >= min_size)
            .min_by_key(|e| (e.size, e.offset))
            .copied();
        let from_retired = state
            .retired
            .values()
            .filter(|e| e.size >= min_size)
            .min_by_key(|e| (e.size, e.offset))
            .copied();

        let best = match (from_free, from_retired) {
            (Some(a), Some(b)) if b.size < a.size => Some(b),
            (Some(a), _) => Some(a),
            (None, b) => b,
        }?;
        if state.entries.get(&best.key).map(|e| e.offset) == Some(best.offset)
            && state.entries.get(&best.key).is_some_and(|e| e.is_free)
        {
            state.entries.remove(&best.key);
        } else {
            state.retired.remove(&best.offset);
        }
        Some(best)
    }

    /// Point-in-time copy of every entry, free ones included
    pub fn snapshot_entries(&self) -> Vec<TocEntry> {
        self.state.read().entries.values().copied().collect()
    }

    /// Live, non-reserved entries ordered by offset
    pub fn active_entries(&self) -> Vec<TocEntry> {
        let mut active: Vec<TocEntry> = self
            .state
            .read()
            .entries
            .values()
            .filter(|e| !e.is_free && !e.key.is_reserved())
            .copied()
            .collect();
        active.sort_by_key(|e| e.offset);
        active
    }

    /// Replace the whole entry set (after a shrink)
    pub fn replace_all(&self, entries: Vec<TocEntry>) {
        let mut state = self.state.write();
        state.entries = entries.into_iter().map(|e| (e.key, e)).collect();
        state.retired.clear();
    }

    /// Number of entries, free ones included
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// True if the TOC holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand out the next store-wide version
    pub fn allocate_version(&self) -> u32 {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }

    /// Highest version handed out or observed so far
    pub fn max_version(&self) -> u32 {
        self.next_version.load(Ordering::SeqCst).saturating_sub(1)
    }

    /// Make sure future versions exceed `version`
    pub fn observe_version(&self, version: u32) {
        self.next_version
            .fetch_max(version.saturating_add(1), Ordering::SeqCst);
    }

    /// Counters describing the TOC contents
    pub fn stats(&self) -> TocStats {
        let state = self.state.read();
        let mut stats = TocStats::default();
        for entry in state.entries.values() {
            if entry.is_free {
                stats.free += 1;
                stats.reclaimable_bytes += entry.size;
            } else {
                stats.live += 1;
                stats.live_bytes += entry.size;
            }
        }
        stats.retired = state.retired.len();
        stats.reclaimable_bytes += state.retired.values().map(|e| e.size).sum::<u64>();
        stats
    }
}
