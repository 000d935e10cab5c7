//! Record store: byte-exact persistence of (key, version, payload) slots
//!
//! The record store owns the file. It knows nothing about entities or the
//! table of contents; it writes headers and payloads at offsets chosen by
//! the caller, flips tombstone flags, and walks the file front to back.
//!
//! # Append cursor
//!
//! `end` is the offset where the next slot will be placed. Concurrent
//! appenders call [`RecordStore::reserve`], which hands out disjoint
//! regions and stamps each one with a tombstone header before returning.
//! Only the store-wide exclusive holder (shrink) may move the cursor
//! backwards, through [`RecordStore::install`].
//!
//! # Sealed files
//!
//! After [`RecordStore::seal`] the file ends with a TOC record and a
//! footer past `end`. The first mutation of any kind truncates that tail
//! away, so a crash afterwards can never present a stale TOC.

use crate::format::{
    payload_checksum, RecordHeader, RecordMeta, TocFooter, FOOTER_SIZE, HEADER_SIZE,
};
use parking_lot::Mutex;
use rackdb_core::{EntityKey, Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Open-time options for a [`RecordStore`]
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordStoreOptions {
    /// fsync after every committed write and tombstone
    pub sync_writes: bool,
}

/// Outcome of a sequential scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Headers visited, tombstones included
    pub records: u64,
    /// Headers with the in-use flag set
    pub live: u64,
    /// Offset just past the last complete slot
    pub end: u64,
    /// A partial header or payload was found at the tail
    pub torn_tail: bool,
}

/// Single-file record store
pub struct RecordStore {
    path: PathBuf,
    file: Mutex<File>,
    end: AtomicU64,
    /// Offset of the persisted TOC record while the file is sealed
    sealed_at: Mutex<Option<u64>>,
    options: RecordStoreOptions,
}

impl RecordStore {
    /// Open or create the record file at `path`
    ///
    /// The append cursor starts at the physical end of the file. Callers
    /// that find a TOC footer move it back with [`RecordStore::adopt_seal`].
    pub fn open(path: impl AsRef<Path>, options: RecordStoreOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let len = file.metadata()?.len();

        debug!(path = %path.display(), len, "opened record file");

        Ok(RecordStore {
            path,
            file: Mutex::new(file),
            end: AtomicU64::new(len),
            sealed_at: Mutex::new(None),
            options,
        })
    }

    /// Path of the record file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset of the next appended slot
    pub fn end(&self) -> u64 {
        self.end.load(Ordering::SeqCst)
    }

    /// Physical file length, including any sealed TOC tail
    pub fn file_len(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    /// True while a persisted TOC tail is present
    pub fn is_sealed(&self) -> bool {
        self.sealed_at.lock().is_some()
    }

    /// Reserve `slot_size` bytes at the end of the file
    ///
    /// Returns the offset of the reserved region. Disjoint for concurrent
    /// callers.
    ///
    /// The region is stamped with a tombstoned header under the reserved
    /// key before any later slot can extend the file, so a slot whose
    /// write never lands still scans as free space.
    pub fn reserve(&self, slot_size: u64) -> Result<u64> {
        let capacity = slot_size
            .checked_sub(HEADER_SIZE as u64)
            .ok_or_else(|| {
                Error::RangeViolation(format!(
                    "slot of {} bytes cannot hold a {}-byte header",
                    slot_size, HEADER_SIZE
                ))
            })?;
        let capacity =
            u32::try_from(capacity).map_err(|_| Error::PayloadTooLarge(capacity as usize))?;
        self.unseal()?;

        let placeholder = RecordHeader {
            key: EntityKey::RESERVED,
            version: 0,
            length: 0,
            capacity,
            in_use: false,
            checksum: payload_checksum(&[]),
        };
        let mut file = self.file.lock();
        let offset = self.end.fetch_add(slot_size, Ordering::SeqCst);
        if let Err(e) = stamp_slot(&mut file, offset, slot_size, &placeholder) {
            // Nothing else can reserve while the file lock is held.
            let _ = self.end.compare_exchange(
                offset + slot_size,
                offset,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            return Err(e);
        }
        Ok(offset)
    }

    /// Begin writing a record whose slot capacity equals its length
    pub fn write(&self, offset: u64, payload_len: usize, meta: RecordMeta) -> Result<RecordWriter<'_>> {
        self.write_slot(offset, payload_len, payload_len, meta)
    }

    /// Begin writing a record into a slot owning `capacity` payload bytes
    ///
    /// The returned writer accepts exactly `payload_len` bytes; nothing
    /// reaches the file until [`RecordWriter::commit`].
    pub fn write_slot(
        &self,
        offset: u64,
        payload_len: usize,
        capacity: usize,
        meta: RecordMeta,
    ) -> Result<RecordWriter<'_>> {
        let length = u32::try_from(payload_len).map_err(|_| Error::PayloadTooLarge(payload_len))?;
        let capacity = u32::try_from(capacity).map_err(|_| Error::PayloadTooLarge(capacity))?;
        if length > capacity {
            return Err(Error::RangeViolation(format!(
                "payload length {} exceeds slot capacity {}",
                length, capacity
            )));
        }
        if offset > self.end() {
            return Err(Error::RangeViolation(format!(
                "write offset {} is past the end of the store ({})",
                offset,
                self.end()
            )));
        }
        self.unseal()?;

        Ok(RecordWriter {
            store: self,
            offset,
            meta,
            length,
            capacity,
            buf: Vec::with_capacity(payload_len),
            overflowed: false,
        })
    }

    /// Write a complete payload in one call
    pub fn write_payload(
        &self,
        offset: u64,
        meta: RecordMeta,
        payload: &[u8],
        capacity: usize,
    ) -> Result<RecordHeader> {
        let mut writer = self.write_slot(offset, payload.len(), capacity, meta)?;
        writer.write_all(payload)?;
        writer.commit()
    }

    /// Read the header at `offset`
    pub fn read_header(&self, offset: u64) -> Result<RecordHeader> {
        check_range(offset, HEADER_SIZE as u64, self.end())?;
        let mut bytes = [0u8; HEADER_SIZE];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut bytes)?;
        }
        RecordHeader::from_bytes(offset, &bytes)
    }

    /// Read the header at `offset` and a reader over exactly its payload
    ///
    /// # Errors
    ///
    /// - `RangeViolation` if the slot lies outside the store
    /// - `FormatCorruption` if the header or the payload checksum is bad
    pub fn read(&self, offset: u64) -> Result<(RecordHeader, RecordReader)> {
        self.read_bounded(offset, self.end())
    }

    /// Read the persisted TOC record, which lives past the append cursor
    pub fn read_sealed(&self, offset: u64) -> Result<(RecordHeader, RecordReader)> {
        let limit = self.file_len()?;
        self.read_bounded(offset, limit)
    }

    fn read_bounded(&self, offset: u64, limit: u64) -> Result<(RecordHeader, RecordReader)> {
        check_range(offset, HEADER_SIZE as u64, limit)?;
        let mut bytes = [0u8; HEADER_SIZE];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut bytes)?;
        let header = RecordHeader::from_bytes(offset, &bytes)?;

        check_range(offset, header.slot_size(), limit)?;
        let mut payload = vec![0u8; header.length as usize];
        file.read_exact(&mut payload)?;
        drop(file);

        if payload_checksum(&payload) != header.checksum {
            return Err(Error::corruption(offset, "payload checksum mismatch"));
        }
        Ok((header, RecordReader::new(payload)))
    }

    /// Flip the in-use flag off, leaving key, version and payload intact
    pub fn mark_as_not_used(&self, offset: u64) -> Result<()> {
        let mut header = self.read_header(offset)?;
        self.unseal()?;
        header.in_use = false;
        let bytes = header.to_bytes();

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset + 1))?;
        file.write_all(&bytes[1..2])?;
        if self.options.sync_writes {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Visit every header from the start of the file up to the append cursor
    pub fn read_all<F>(&self, visitor: F) -> Result<ScanSummary>
    where
        F: FnMut(u64, &RecordHeader) -> Result<()>,
    {
        self.read_range(0, self.end(), visitor)
    }

    /// Visit every header in `[start, limit)`
    ///
    /// Each header, used or not, is handed to `visitor` together with its
    /// offset, then the scan skips the slot's capacity. A header or
    /// payload that runs past `limit` is a torn tail: the scan stops and
    /// reports it instead of failing.
    ///
    /// # Errors
    ///
    /// `FormatCorruption` for a malformed header; visitor errors propagate.
    pub fn read_range<F>(&self, start: u64, limit: u64, mut visitor: F) -> Result<ScanSummary>
    where
        F: FnMut(u64, &RecordHeader) -> Result<()>,
    {
        let mut summary = ScanSummary {
            end: start,
            ..ScanSummary::default()
        };
        let mut offset = start;
        let mut bytes = [0u8; HEADER_SIZE];

        while offset < limit {
            if limit - offset < HEADER_SIZE as u64 {
                summary.torn_tail = true;
                break;
            }
            {
                let mut file = self.file.lock();
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut bytes)?;
            }
            let header = RecordHeader::from_bytes(offset, &bytes)?;
            let next = offset + header.slot_size();
            if next > limit {
                summary.torn_tail = true;
                break;
            }

            visitor(offset, &header)?;
            summary.records += 1;
            if header.in_use {
                summary.live += 1;
            }
            offset = next;
            summary.end = offset;
        }
        Ok(summary)
    }

    /// Read the TOC footer at the physical end of the file, if any
    pub fn read_footer(&self) -> Result<Option<TocFooter>> {
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        if len < FOOTER_SIZE as u64 {
            return Ok(None);
        }
        let mut bytes = [0u8; FOOTER_SIZE];
        file.seek(SeekFrom::Start(len - FOOTER_SIZE as u64))?;
        file.read_exact(&mut bytes)?;
        Ok(TocFooter::from_bytes(&bytes).filter(|f| f.toc_offset < len))
    }

    /// Append `toc_payload` as the reserved key-zero record plus a footer
    ///
    /// The append cursor does not move: the TOC tail lives past `end` and
    /// is discarded by the next mutation.
    pub fn seal(&self, meta: RecordMeta, toc_payload: &[u8]) -> Result<u64> {
        self.unseal()?;
        let toc_offset = self.end();
        let length =
            u32::try_from(toc_payload.len()).map_err(|_| Error::PayloadTooLarge(toc_payload.len()))?;
        let header = RecordHeader {
            key: meta.key,
            version: meta.version,
            length,
            capacity: length,
            in_use: true,
            checksum: payload_checksum(toc_payload),
        };
        let footer = TocFooter { toc_offset };

        let mut buf = Vec::with_capacity(HEADER_SIZE + toc_payload.len() + FOOTER_SIZE);
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(toc_payload);
        buf.extend_from_slice(&footer.to_bytes());

        {
            let mut file = self.file.lock();
            file.set_len(toc_offset)?;
            file.seek(SeekFrom::Start(toc_offset))?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        *self.sealed_at.lock() = Some(toc_offset);
        info!(toc_offset, bytes = buf.len(), "sealed record file with TOC");
        Ok(toc_offset)
    }

    /// Accept an existing sealed tail found at open time
    ///
    /// Moves the append cursor back to `toc_offset` so new slots overwrite
    /// the TOC record once it has been discarded.
    pub fn adopt_seal(&self, toc_offset: u64) {
        self.end.store(toc_offset, Ordering::SeqCst);
        *self.sealed_at.lock() = Some(toc_offset);
    }

    /// Drop the sealed TOC tail, if present
    pub fn unseal(&self) -> Result<()> {
        let mut sealed = self.sealed_at.lock();
        if let Some(toc_offset) = *sealed {
            self.file.lock().set_len(toc_offset)?;
            *sealed = None;
            debug!(toc_offset, "discarded persisted TOC tail");
        }
        Ok(())
    }

    /// Cut the file (and the append cursor) back to `len`
    pub fn truncate(&self, len: u64) -> Result<()> {
        *self.sealed_at.lock() = None;
        self.file.lock().set_len(len)?;
        self.end.store(len, Ordering::SeqCst);
        Ok(())
    }

    /// Flush file contents to disk
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    /// Replace this store's file with a fully written `shadow`
    ///
    /// The shadow is synced and renamed over this store's path, then
    /// reopened in place. Until the rename succeeds the original file,
    /// its seal included, is untouched; a failed rename removes the shadow.
    pub fn install(&self, shadow: RecordStore) -> Result<()> {
        shadow.sync()?;
        let shadow_end = shadow.end();
        let shadow_path = shadow.path.clone();
        drop(shadow);

        let mut sealed = self.sealed_at.lock();
        let mut file = self.file.lock();
        if let Err(e) = std::fs::rename(&shadow_path, &self.path) {
            let _ = std::fs::remove_file(&shadow_path);
            return Err(e.into());
        }
        *sealed = None;
        *file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.end.store(shadow_end, Ordering::SeqCst);
        info!(path = %self.path.display(), end = shadow_end, "installed compacted file");
        Ok(())
    }

    fn commit_slot(&self, offset: u64, header: &RecordHeader, payload: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(payload);

        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&buf)?;
            // Unused capacity must exist on disk so scans can step over it.
            let slot_end = offset + header.slot_size();
            if file.metadata()?.len() < slot_end {
                file.set_len(slot_end)?;
            }
            if self.options.sync_writes {
                file.sync_data()?;
            }
        }
        self.end.fetch_max(offset + header.slot_size(), Ordering::SeqCst);
        Ok(())
    }
}

fn stamp_slot(file: &mut File, offset: u64, slot_size: u64, header: &RecordHeader) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&header.to_bytes())?;
    let slot_end = offset + slot_size;
    if file.metadata()?.len() < slot_end {
        file.set_len(slot_end)?;
    }
    Ok(())
}

fn check_range(offset: u64, len: u64, limit: u64) -> Result<()> {
    match offset.checked_add(len) {
        Some(stop) if stop <= limit => Ok(()),
        _ => Err(Error::RangeViolation(format!(
            "access of {} bytes at offset {} is outside the store ({} bytes)",
            len, offset, limit
        ))),
    }
}

/// Scoped payload buffer returned by [`RecordStore::write`]
pub struct RecordWriter<'a> {
    store: &'a RecordStore,
    offset: u64,
    meta: RecordMeta,
    length: u32,
    capacity: u32,
    buf: Vec<u8>,
    overflowed: bool,
}

impl RecordWriter<'_> {
    /// Bytes still expected before the payload is complete
    pub fn remaining(&self) -> usize {
        self.length as usize - self.buf.len()
    }

    /// Write header and payload to the file
    ///
    /// # Errors
    ///
    /// `RangeViolation` if the payload is shorter or longer than announced.
    pub fn commit(self) -> Result<RecordHeader> {
        if self.overflowed || self.buf.len() != self.length as usize {
            return Err(Error::RangeViolation(format!(
                "payload of {} bytes announced, {} written",
                self.length,
                self.buf.len()
            )));
        }
        let header = RecordHeader {
            key: self.meta.key,
            version: self.meta.version,
            length: self.length,
            capacity: self.capacity,
            in_use: true,
            checksum: payload_checksum(&self.buf),
        };
        self.store.commit_slot(self.offset, &header, &self.buf)?;
        Ok(header)
    }
}

impl Write for RecordWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.len() > self.remaining() {
            self.overflowed = true;
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "payload exceeds announced length",
            ));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Forward-only reader over exactly one record's payload
#[derive(Debug, Clone)]
pub struct RecordReader {
    payload: Vec<u8>,
    pos: usize,
}

impl RecordReader {
    fn new(payload: Vec<u8>) -> Self {
        RecordReader { payload, pos: 0 }
    }

    /// Payload length
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True for an empty payload
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Current read position
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Unread bytes
    pub fn remaining(&self) -> &[u8] {
        &self.payload[self.pos..]
    }

    /// Move the cursor to `pos`
    ///
    /// # Errors
    ///
    /// `RangeViolation` when moving backwards or past the payload end.
    pub fn seek_to(&mut self, pos: usize) -> Result<()> {
        if pos < self.pos {
            return Err(Error::RangeViolation(format!(
                "cannot seek backwards from {} to {}",
                self.pos, pos
            )));
        }
        if pos > self.payload.len() {
            return Err(Error::RangeViolation(format!(
                "seek to {} is past payload end {}",
                pos,
                self.payload.len()
            )));
        }
        self.pos = pos;
        Ok(())
    }

    /// Skip `n` bytes forward
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.seek_to(self.pos.saturating_add(n))
    }

    /// Take the whole payload, regardless of the cursor
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

impl Read for RecordReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = out.len().min(self.payload.len() - self.pos);
        out[..n].copy_from_slice(&self.payload[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rackdb_core::EntityKey;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, RecordStore) {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(dir.path().join("data.rdb"), RecordStoreOptions::default())
            .unwrap();
        (dir, store)
    }

    fn append(store: &RecordStore, key: EntityKey, version: u32, payload: &[u8]) -> u64 {
        let offset = store
            .reserve((HEADER_SIZE + payload.len()) as u64)
            .unwrap();
        store
            .write_payload(offset, RecordMeta::new(key, version), payload, payload.len())
            .unwrap();
        offset
    }

    #[test]
    fn test_write_then_read_at_offset_zero() {
        let (_dir, store) = open_store();
        let key = EntityKey::new();
        let payload = *b"sixteen byte pay";

        let mut writer = store
            .write(0, payload.len(), RecordMeta::new(key, 7))
            .unwrap();
        writer.write_all(&payload).unwrap();
        writer.commit().unwrap();

        let (header, mut reader) = store.read(0).unwrap();
        assert!(header.in_use);
        assert_eq!(header.key, key);
        assert_eq!(header.version, 7);
        assert_eq!(header.length, 16);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn test_mark_as_not_used_is_a_tombstone() {
        let (_dir, store) = open_store();
        let key = EntityKey::new();
        let offset = append(&store, key, 7, b"sixteen byte pay");

        store.mark_as_not_used(offset).unwrap();

        let (header, reader) = store.read(offset).unwrap();
        assert!(!header.in_use);
        assert_eq!(header.key, key);
        assert_eq!(header.version, 7);
        assert_eq!(reader.into_payload(), b"sixteen byte pay");
    }

    #[test]
    fn test_uncommitted_writer_writes_nothing() {
        let (_dir, store) = open_store();
        let mut writer = store.write(0, 4, RecordMeta::new(EntityKey::new(), 1)).unwrap();
        writer.write_all(b"abcd").unwrap();
        drop(writer);
        assert_eq!(store.file_len().unwrap(), 0);
    }

    #[test]
    fn test_writer_rejects_overflow_and_short_payloads() {
        let (_dir, store) = open_store();
        let meta = RecordMeta::new(EntityKey::new(), 1);

        let mut writer = store.write(0, 2, meta).unwrap();
        assert!(writer.write_all(b"abc").is_err());
        assert!(matches!(writer.commit(), Err(Error::RangeViolation(_))));

        let mut writer = store.write(0, 4, meta).unwrap();
        writer.write_all(b"ab").unwrap();
        assert!(matches!(writer.commit(), Err(Error::RangeViolation(_))));
    }

    #[test]
    fn test_read_out_of_range() {
        let (_dir, store) = open_store();
        append(&store, EntityKey::new(), 1, b"x");
        assert!(matches!(store.read(4096), Err(Error::RangeViolation(_))));
    }

    #[test]
    fn test_reader_is_forward_only() {
        let (_dir, store) = open_store();
        let offset = append(&store, EntityKey::new(), 1, b"0123456789");
        let (_, mut reader) = store.read(offset).unwrap();

        reader.skip(4).unwrap();
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"45");
        assert!(matches!(reader.seek_to(1), Err(Error::RangeViolation(_))));
        assert!(matches!(reader.skip(100), Err(Error::RangeViolation(_))));

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"6789");
    }

    #[test]
    fn test_read_all_visits_live_and_tombstoned() {
        let (_dir, store) = open_store();
        let a = append(&store, EntityKey::new(), 1, b"aaaa");
        let b = append(&store, EntityKey::new(), 2, b"bb");
        let c = append(&store, EntityKey::new(), 3, b"cccccc");
        store.mark_as_not_used(b).unwrap();

        let mut seen = Vec::new();
        let summary = store
            .read_all(|offset, header| {
                seen.push((offset, header.in_use));
                Ok(())
            })
            .unwrap();

        assert_eq!(seen, vec![(a, true), (b, false), (c, true)]);
        assert_eq!(summary.records, 3);
        assert_eq!(summary.live, 2);
        assert_eq!(summary.end, store.end());
        assert!(!summary.torn_tail);
    }

    #[test]
    fn test_smaller_payload_keeps_slot_capacity() {
        let (_dir, store) = open_store();
        let key = EntityKey::new();
        let first = append(&store, key, 1, b"long payload here");
        let second = append(&store, EntityKey::new(), 2, b"next");

        store
            .write_payload(first, RecordMeta::new(key, 3), b"short", 17)
            .unwrap();

        let mut offsets = Vec::new();
        store
            .read_all(|offset, _| {
                offsets.push(offset);
                Ok(())
            })
            .unwrap();
        assert_eq!(offsets, vec![first, second]);

        let (header, reader) = store.read(first).unwrap();
        assert_eq!(header.capacity, 17);
        assert_eq!(reader.into_payload(), b"short");
    }

    #[test]
    fn test_torn_tail_is_reported() {
        let (_dir, store) = open_store();
        append(&store, EntityKey::new(), 1, b"complete");
        let good_end = store.end();

        // A header that claims more payload than the file holds.
        let offset = store.reserve(HEADER_SIZE as u64 + 64).unwrap();
        let header = RecordHeader {
            key: EntityKey::new(),
            version: 2,
            length: 64,
            capacity: 64,
            in_use: true,
            checksum: 0,
        };
        {
            let mut file = store.file.lock();
            file.seek(SeekFrom::Start(offset)).unwrap();
            file.write_all(&header.to_bytes()).unwrap();
        }
        store.truncate(offset + HEADER_SIZE as u64 + 10).unwrap();

        let summary = store.read_all(|_, _| Ok(())).unwrap();
        assert!(summary.torn_tail);
        assert_eq!(summary.end, good_end);
        assert_eq!(summary.records, 1);
    }

    #[test]
    fn test_corrupt_marker_fails_scan() {
        let (_dir, store) = open_store();
        let offset = append(&store, EntityKey::new(), 1, b"payload");
        {
            let mut file = store.file.lock();
            file.seek(SeekFrom::Start(offset)).unwrap();
            file.write_all(&[0x00]).unwrap();
        }
        let err = store.read_all(|_, _| Ok(())).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_payload_checksum_is_verified() {
        let (_dir, store) = open_store();
        let offset = append(&store, EntityKey::new(), 1, b"payload");
        {
            let mut file = store.file.lock();
            file.seek(SeekFrom::Start(offset + HEADER_SIZE as u64)).unwrap();
            file.write_all(b"X").unwrap();
        }
        assert!(store.read(offset).unwrap_err().is_corruption());
    }

    #[test]
    fn test_seal_and_unseal() {
        let (_dir, store) = open_store();
        append(&store, EntityKey::new(), 1, b"data");
        let end = store.end();

        let toc_offset = store
            .seal(RecordMeta::new(EntityKey::RESERVED, 2), b"toc bytes")
            .unwrap();
        assert_eq!(toc_offset, end);
        assert!(store.is_sealed());
        assert_eq!(store.end(), end);
        assert_eq!(
            store.read_footer().unwrap().map(|f| f.toc_offset),
            Some(toc_offset)
        );

        append(&store, EntityKey::new(), 3, b"more");
        assert!(!store.is_sealed());
        assert_eq!(store.read_footer().unwrap(), None);
        assert_eq!(store.file_len().unwrap(), store.end());
    }

    #[test]
    fn test_reserve_stamps_a_free_slot() {
        let (_dir, store) = open_store();
        let offset = store.reserve(HEADER_SIZE as u64 + 8).unwrap();
        assert_eq!(store.file_len().unwrap(), store.end());

        let header = store.read_header(offset).unwrap();
        assert!(header.key.is_reserved());
        assert!(!header.in_use);
        assert_eq!(header.capacity, 8);

        let summary = store.read_all(|_, _| Ok(())).unwrap();
        assert_eq!((summary.records, summary.live), (1, 0));
        assert!(!summary.torn_tail);
    }

    #[test]
    fn test_reserve_rejects_slot_smaller_than_header() {
        let (_dir, store) = open_store();
        assert!(matches!(store.reserve(10), Err(Error::RangeViolation(_))));
        assert_eq!(store.end(), 0);
    }

    #[test]
    fn test_failed_install_keeps_seal() {
        let (dir, store) = open_store();
        let offset = append(&store, EntityKey::new(), 1, b"data");
        store
            .seal(RecordMeta::new(EntityKey::RESERVED, 2), b"toc bytes")
            .unwrap();

        let shadow_path = dir.path().join("data.rdb.shrink");
        let shadow = RecordStore::open(&shadow_path, RecordStoreOptions::default()).unwrap();
        std::fs::remove_file(&shadow_path).unwrap();

        assert!(store.install(shadow).is_err());
        assert!(store.is_sealed());
        assert!(store.read_footer().unwrap().is_some());
        assert_eq!(store.read(offset).unwrap().1.into_payload(), b"data");
    }
}
