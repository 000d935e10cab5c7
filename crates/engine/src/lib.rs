//! Store engine for rackdb
//!
//! This crate ties the lower layers together:
//! - Store: open/close, keyed CRUD, shrink, checkpoint
//! - Codecs: entity payload encoding (MessagePack by default)
//! - Query planner: indexed, materialized and streaming row sources
//! - Secondary indexes: pluggable, kept current by the store
//! - Background scheduler: worker threads for the TOC rebuild
//!
//! The engine is the only component that knows about:
//! - TOC readiness and when callers must wait for it
//! - Lock ordering between the store gate and entity locks

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod background;
pub mod codec;
pub mod index;
pub mod query;
pub mod store;

pub use background::{BackgroundScheduler, SchedulerStats};
pub use codec::{BincodeCodec, EntityCodec, JsonCodec, MessagePackCodec};
pub use index::{FieldIndex, SecondaryIndex};
pub use query::{field, lit, CmpOp, Expr, Query, QueryIter, QueryPlan, Strategy};
pub use store::{
    Attempt, Durability, ShrinkReport, Store, StoreConfig, StoreStats, CONFIG_FILE_NAME,
    DEFAULT_MATERIALIZE_THRESHOLD,
};

pub use rackdb_concurrency::{Acquire, CancellationToken};
pub use rackdb_core::{EntityKey, Error, FieldPath, Result, Value};
