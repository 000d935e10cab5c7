//! Record file integration tests
//!
//! Exercises the record store and TOC together across reopen cycles,
//! including files left behind by an interrupted process.

use proptest::prelude::*;
use rand::Rng;
use rackdb_core::{EntityKey, InlineScheduler};
use rackdb_storage::{RecordMeta, RecordStore, RecordStoreOptions, Toc, HEADER_SIZE};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn open(path: &Path) -> Arc<RecordStore> {
    Arc::new(RecordStore::open(path, RecordStoreOptions::default()).unwrap())
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

fn load_toc(store: &Arc<RecordStore>) -> Arc<Toc> {
    let (toc, ready) = Toc::create(store, &InlineScheduler).unwrap();
    ready.wait().unwrap();
    toc
}

// === Reopen Scenarios ===

#[test]
fn scenario_clean_close_reopens_from_persisted_toc() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("clean.rdb");
    let keys: Vec<EntityKey> = (0..10).map(|_| EntityKey::new()).collect();

    {
        let store = open(&path);
        for (i, key) in keys.iter().enumerate() {
            append(&store, *key, i as u32 + 1, format!("entity-{}", i).as_bytes());
        }
        let toc = load_toc(&store);
        toc.persist(&store).unwrap();
    }

    let store = open(&path);
    let toc = load_toc(&store);
    assert!(store.is_sealed());
    for key in &keys {
        let entry = toc.try_get_entry(key).unwrap();
        let (header, reader) = store.read(entry.offset).unwrap();
        assert_eq!(header.key, *key);
        assert!(reader.into_payload().starts_with(b"entity-"));
    }
}

#[test]
fn scenario_append_after_reopen_discards_stale_toc() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("stale.rdb");
    let first = EntityKey::new();
    let second = EntityKey::new();

    {
        let store = open(&path);
        append(&store, first, 1, b"first");
        let toc = load_toc(&store);
        toc.persist(&store).unwrap();
    }
    {
        // Simulated crash: append without persisting a new TOC.
        let store = open(&path);
        let _toc = load_toc(&store);
        append(&store, second, 2, b"second");
        assert!(!store.is_sealed());
    }

    let store = open(&path);
    let toc = load_toc(&store);
    assert!(toc.try_get_entry(&first).is_some());
    assert!(toc.try_get_entry(&second).is_some());
}

#[test]
fn scenario_partial_record_at_tail_is_truncated() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("torn.rdb");
    let key = EntityKey::new();
    let intact_end;

    {
        let store = open(&path);
        append(&store, key, 1, b"complete");
        intact_end = store.end();
    }
    {
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xA7, 0x01, 0, 0, 1, 2, 3]).unwrap();
    }

    let store = open(&path);
    let toc = load_toc(&store);
    assert!(toc.try_get_entry(&key).is_some());
    assert_eq!(store.end(), intact_end);
    assert_eq!(store.file_len().unwrap(), intact_end);
}

#[test]
fn scenario_garbage_marker_fails_rebuild() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("garbage.rdb");
    {
        let store = open(&path);
        append(&store, EntityKey::new(), 1, b"ok");
    }
    {
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0u8; 64]).unwrap();
    }

    let store = open(&path);
    let (toc, ready) = Toc::create(&store, &InlineScheduler).unwrap();
    assert!(ready.wait().is_err());
    assert!(!toc.is_ready());
}

#[test]
fn scenario_abandoned_reservation_scans_as_free_space() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("abandoned.rdb");
    let key = EntityKey::new();
    let (abandoned, written) = {
        let store = open(&path);
        // A writer that reserved its slot and died before writing it.
        let abandoned = store.reserve(44).unwrap();
        let written = store.reserve(44).unwrap();
        store
            .write_payload(written, RecordMeta::new(key, 1), b"eight by", 8)
            .unwrap();
        (abandoned, written)
    };

    let store = open(&path);
    let toc = load_toc(&store);
    assert_eq!(toc.try_get_entry(&key).unwrap().offset, written);
    assert_eq!(toc.len(), 1);

    let reclaimed = toc.take_free_slot(44).unwrap();
    assert_eq!(reclaimed.offset, abandoned);
    assert_eq!(reclaimed.size, 44);
}

// === Concurrent Appends ===

#[test]
fn test_concurrent_appends_get_disjoint_slots() {
    let dir = tempdir().unwrap();
    let store = open(&dir.path().join("concurrent.rdb"));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                (0..25)
                    .map(|_| {
                        let payload = vec![t as u8; rng.gen_range(0..300)];
                        let key = EntityKey::new();
                        (key, append(&store, key, 1, &payload))
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let written: Vec<(EntityKey, u64)> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    let toc = load_toc(&store);
    assert_eq!(toc.active_entries().len(), 200);
    for (key, offset) in written {
        assert_eq!(toc.try_get_entry(&key).unwrap().offset, offset);
    }
}

// === Property Tests ===

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_rebuilt_toc_matches_written_state(
        ops in prop::collection::vec((0usize..8, prop::collection::vec(any::<u8>(), 0..64), any::<bool>()), 1..40)
    ) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prop.rdb");
        let keys: Vec<EntityKey> = (0..8).map(|_| EntityKey::new()).collect();
        let mut expected: HashMap<EntityKey, (u64, bool)> = HashMap::new();

        {
            let store = open(&path);
            for (version, (k, payload, delete)) in ops.iter().enumerate() {
                let key = keys[*k];
                if let Some((offset, true)) = expected.get(&key).copied() {
                    store.mark_as_not_used(offset).unwrap();
                }
                let offset = append(&store, key, version as u32 + 1, payload);
                if *delete {
                    store.mark_as_not_used(offset).unwrap();
                }
                expected.insert(key, (offset, !*delete));
            }
        }

        let store = open(&path);
        let toc = load_toc(&store);
        for (key, (offset, live)) in expected {
            let entry = toc.try_get_entry(&key).unwrap();
            prop_assert_eq!(entry.offset, offset);
            prop_assert_eq!(!entry.is_free, live);
        }
    }
}
