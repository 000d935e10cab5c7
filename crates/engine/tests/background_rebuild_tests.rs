//! TOC rebuild on a worker thread
//!
//! A store opened on a file without a persisted TOC must answer reads for
//! keys it has already seen, make writers wait for the scan, and end up
//! with exactly the file's contents.

use rackdb_engine::{field, Acquire, Attempt, EntityKey, Store, StoreConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Event {
    seq: u64,
    kind: String,
}

fn event(seq: u64) -> Event {
    Event {
        seq,
        kind: if seq % 2 == 0 { "even" } else { "odd" }.to_string(),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Write `n` events and close without persisting the TOC
fn write_unsealed(path: &Path, n: u64) -> Vec<EntityKey> {
    let config = StoreConfig {
        persist_toc_on_close: false,
        ..StoreConfig::for_testing()
    };
    let store = Store::open_with_config(path, config).unwrap();
    let keys = (0..n).map(|i| store.add(&event(i)).unwrap()).collect();
    store.close().unwrap();
    keys
}

fn background_config() -> StoreConfig {
    StoreConfig {
        background_rebuild: true,
        scheduler_threads: 2,
        ..StoreConfig::for_testing()
    }
}

#[test]
fn test_background_rebuild_finds_every_record() {
    init_tracing();
    let dir = tempdir().unwrap();
    let path = dir.path().join("events.rdb");
    let keys = write_unsealed(&path, 500);

    let store = Store::open_with_config(&path, background_config()).unwrap();
    assert!(store.scheduler_stats().is_some());
    store.wait_ready().unwrap();
    assert!(store.is_ready());
    assert!(store.stats().unwrap().toc_ready);

    assert_eq!(store.len().unwrap(), 500);
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(store.get::<Event>(key).unwrap(), Some(event(i as u64)));
    }
}

#[test]
fn test_reads_and_writes_during_rebuild() {
    init_tracing();
    let dir = tempdir().unwrap();
    let path = dir.path().join("events.rdb");
    let keys = write_unsealed(&path, 2_000);

    let store = Arc::new(Store::open_with_config(&path, background_config()).unwrap());

    let reader = {
        let store = Arc::clone(&store);
        let keys = keys.clone();
        thread::spawn(move || {
            for (i, key) in keys.iter().enumerate().rev().step_by(97) {
                assert_eq!(store.get::<Event>(key).unwrap(), Some(event(i as u64)));
            }
        })
    };
    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            (0..20)
                .map(|i| store.add(&event(10_000 + i)).unwrap())
                .collect::<Vec<_>>()
        })
    };
    let deleted = keys[7];
    store.delete(&deleted).unwrap();

    reader.join().unwrap();
    let added = writer.join().unwrap();

    assert_eq!(store.len().unwrap(), 2_000 - 1 + 20);
    assert_eq!(store.get::<Event>(&deleted).unwrap(), None);
    for (i, key) in added.iter().enumerate() {
        assert_eq!(store.get::<Event>(key).unwrap(), Some(event(10_000 + i as u64)));
    }
    let evens = store
        .query::<Event>()
        .filter(field("kind").eq("even"))
        .count()
        .unwrap();
    assert_eq!(evens, 1_000 + 10);
}

#[test]
fn test_bounded_get_of_unknown_key_before_ready() {
    init_tracing();
    let dir = tempdir().unwrap();
    let path = dir.path().join("events.rdb");
    write_unsealed(&path, 50);

    let store = Store::open_with_config(&path, background_config()).unwrap();
    match store
        .get_with::<Event>(&EntityKey::new(), &Acquire::timeout(Duration::from_secs(10)))
        .unwrap()
    {
        Attempt::Done(found) => assert_eq!(found, None),
        Attempt::TimedOut => panic!("rebuild of 50 records took over 10s"),
    }
    assert!(store.is_ready());
}

#[test]
fn test_checkpoint_makes_next_open_skip_the_scan() {
    init_tracing();
    let dir = tempdir().unwrap();
    let path = dir.path().join("events.rdb");
    let keys = write_unsealed(&path, 30);

    {
        let store = Store::open_with_config(&path, background_config()).unwrap();
        store.checkpoint().unwrap();
        assert!(store.stats().unwrap().sealed);
    }

    let store = Store::open_with_config(&path, background_config()).unwrap();
    assert!(store.is_ready());
    assert_eq!(store.get::<Event>(&keys[29]).unwrap(), Some(event(29)));
}

#[test]
fn test_close_cancels_waiters() {
    let dir = tempdir().unwrap();
    let store = Store::open_with_config(dir.path().join("c.rdb"), StoreConfig::for_testing())
        .unwrap();
    let token = store.cancellation();
    assert!(!token.is_cancelled());
    store.close().unwrap();
    assert!(token.is_cancelled());
    assert_eq!(store.contended_keys(), 0);
}
