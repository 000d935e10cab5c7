//! Concurrency layer for rackdb
//!
//! This crate implements the blocking lock primitives the store relies on:
//! - SharedExclusive: many readers or one writer, waiting writers first
//! - EntityLockManager: one SharedExclusive per entity key, rented on use
//!   and evicted when the last holder leaves
//! - StoreGate: store-wide shared/exclusive mode (shrink runs exclusive)
//! - Acquire + CancellationToken: bounded and cancellable waits
//!
//! All waits block the calling thread. A wait that runs out of time returns
//! `Ok(None)`; a cancelled wait returns `Err(Error::Cancelled)`. Neither
//! leaves anything behind.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod acquire;
pub mod entity;
pub mod gate;
pub mod primitive;

pub use acquire::{Acquire, CancellationToken};
pub use entity::{EntityLockManager, EntityReadGuard, EntityWriteGuard};
pub use gate::{ExclusiveGuard, SharedGuard, StoreGate};
pub use primitive::SharedExclusive;
