//! Compaction by copy-and-rename
//!
//! Live records are copied in file order into `<path>.shrink`, which is
//! synced and renamed over the original. Until the rename the original is
//! untouched, so a crash leaves either the old file or the new one, plus
//! possibly a stale shadow that the next shrink overwrites.

use super::Store;
use crate::codec::EntityCodec;
use rackdb_concurrency::Acquire;
use rackdb_core::{Error, Result};
use rackdb_storage::{RecordMeta, RecordStore, RecordStoreOptions, TocEntry, HEADER_SIZE};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// What a shrink achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShrinkReport {
    /// File length before, persisted TOC included
    pub bytes_before: u64,
    /// File length after
    pub bytes_after: u64,
    /// Live records copied
    pub records_kept: usize,
    /// Free and retired slots dropped
    pub slots_reclaimed: usize,
}

impl ShrinkReport {
    /// Bytes given back to the file system
    pub fn bytes_reclaimed(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// `<path>.shrink`
pub(crate) fn shadow_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".shrink");
    PathBuf::from(name)
}

impl<C: EntityCodec> Store<C> {
    /// Rewrite the file without deleted records or slack
    ///
    /// Runs with the store gate held exclusively: in-flight operations
    /// finish first and new ones wait. Keys, versions and payload bytes are
    /// unchanged; each slot's capacity shrinks to its payload length.
    ///
    /// # Errors
    ///
    /// Any failure before the rename leaves the original file as it was
    /// and removes the shadow file.
    pub fn shrink(&self) -> Result<ShrinkReport> {
        let _exclusive = self
            .gate
            .enter_exclusive(&Acquire::unbounded().with_cancel(self.cancel.clone()))?
            .ok_or(Error::Closed)?;
        self.ensure_open()?;
        self.wait_ready()?;

        let before = self.toc.stats();
        let bytes_before = self.records.file_len()?;
        let shadow_path = shadow_path(&self.path);

        let (shadow, entries) = match self.copy_live_records(&shadow_path) {
            Ok(copied) => copied,
            Err(e) => {
                if let Err(cleanup) = std::fs::remove_file(&shadow_path) {
                    warn!(error = %cleanup, path = %shadow_path.display(), "failed to remove shrink shadow");
                }
                return Err(e);
            }
        };

        self.records.install(shadow)?;
        let records_kept = entries.len();
        self.toc.replace_all(entries);

        let report = ShrinkReport {
            bytes_before,
            bytes_after: self.records.file_len()?,
            records_kept,
            slots_reclaimed: before.free + before.retired,
        };
        info!(
            bytes_before = report.bytes_before,
            bytes_after = report.bytes_after,
            records_kept = report.records_kept,
            slots_reclaimed = report.slots_reclaimed,
            "shrank record file"
        );
        Ok(report)
    }

    fn copy_live_records(&self, shadow_path: &Path) -> Result<(RecordStore, Vec<TocEntry>)> {
        // A leftover shadow from an interrupted shrink must not leak into this one.
        if shadow_path.exists() {
            std::fs::remove_file(shadow_path)?;
        }
        let shadow = RecordStore::open(shadow_path, RecordStoreOptions::default())?;

        let mut entries = Vec::new();
        for entry in self.toc.active_entries() {
            let (header, reader) = self.records.read(entry.offset)?;
            if header.key != entry.key || !header.in_use {
                return Err(Error::corruption(
                    entry.offset,
                    format!("TOC points {} at a slot holding {}", entry.key, header.key),
                ));
            }
            let payload = reader.into_payload();
            let size = (HEADER_SIZE + payload.len()) as u64;
            let offset = shadow.reserve(size)?;
            shadow.write_payload(
                offset,
                RecordMeta::new(header.key, header.version),
                &payload,
                payload.len(),
            )?;
            entries.push(TocEntry {
                key: header.key,
                offset,
                size,
                is_free: false,
                version: header.version,
            });
        }
        Ok((shadow, entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Blob {
        bytes: Vec<u8>,
    }

    #[test]
    fn test_shadow_path_appends_suffix() {
        assert_eq!(
            shadow_path(Path::new("/data/store.rdb")),
            PathBuf::from("/data/store.rdb.shrink")
        );
    }

    #[test]
    fn test_shrink_drops_deleted_and_slack() {
        let dir = TempDir::new().unwrap();
        let store =
            Store::open_with_config(dir.path().join("blobs.rdb"), StoreConfig::for_testing())
                .unwrap();

        let keep = store.add(&Blob { bytes: vec![1; 200] }).unwrap();
        let drop_me = store.add(&Blob { bytes: vec![2; 200] }).unwrap();
        store.delete(&drop_me).unwrap();
        store.update(&keep, &Blob { bytes: vec![3; 10] }).unwrap();

        let report = store.shrink().unwrap();
        assert_eq!(report.records_kept, 1);
        assert_eq!(report.slots_reclaimed, 1);
        assert!(report.bytes_reclaimed() > 200);

        assert_eq!(store.get::<Blob>(&keep).unwrap(), Some(Blob { bytes: vec![3; 10] }));
        assert_eq!(store.get::<Blob>(&drop_me).unwrap(), None);
        let entry = store.toc().try_get_entry(&keep).unwrap();
        assert_eq!(entry.offset, 0);
        assert!(!shadow_path(store.path()).exists());
    }

    #[test]
    fn test_shrink_preserves_versions() {
        let dir = TempDir::new().unwrap();
        let store =
            Store::open_with_config(dir.path().join("v.rdb"), StoreConfig::for_testing()).unwrap();
        let key = store.add(&Blob { bytes: vec![0; 4] }).unwrap();
        store.update(&key, &Blob { bytes: vec![1; 4] }).unwrap();
        let version = store.toc().try_get_entry(&key).unwrap().version;

        store.shrink().unwrap();
        assert_eq!(store.toc().try_get_entry(&key).unwrap().version, version);
    }
}
