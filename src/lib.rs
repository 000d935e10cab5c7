//! rackdb - embedded single-file record store
//!
//! rackdb keeps serde-serializable entities in one file of fixed-capacity
//! slots. An in-memory table of contents (TOC) maps each entity key to its
//! slot; it is persisted on close and rebuilt by scanning the file when the
//! persisted copy is missing or stale.
//!
//! # Quick Start
//!
//! ```ignore
//! use rackdb::{field, Store};
//!
//! let store = Store::open("people.rdb")?;
//! let key = store.add(&Person { name: "Alice".into(), age: 30 })?;
//! let alice: Option<Person> = store.get(&key)?;
//!
//! let adults = store.query::<Person>().filter(field("age").ge(18)).to_vec()?;
//! store.close()?;
//! ```
//!
//! # Architecture
//!
//! Everything goes through [`Store`]. The record file, TOC and lock layers
//! live in internal crates and are not exposed beyond what the store's API
//! needs.

pub use rackdb_engine::*;
