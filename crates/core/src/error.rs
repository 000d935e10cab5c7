//! Error types for rackdb
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Expected outcomes are not errors: a `get` on an unknown key returns
//! `Ok(None)` and a bounded lock wait that runs out of time returns
//! "not acquired". Everything in [`Error`] is a failure the caller must see.

use crate::types::EntityKey;
use std::io;
use thiserror::Error;

/// Result type alias for rackdb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the record store
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Entity could not be encoded or decoded by the configured codec
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// `update`/`delete` targeted a key that is unknown or already deleted
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityKey),

    /// The byte layout of the file is not what the format requires
    #[error("Format corruption at offset {offset}: {reason}")]
    FormatCorruption {
        /// Byte offset of the offending header or payload
        offset: u64,
        /// What was wrong
        reason: String,
    },

    /// Read, write or seek outside the valid region
    #[error("Range violation: {0}")]
    RangeViolation(String),

    /// A lock handle was misused (double release, use after dispose)
    #[error("Concurrency violation: {0}")]
    ConcurrencyViolation(String),

    /// A lock acquisition was aborted through its cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// The store has been closed
    #[error("Store is closed")]
    Closed,

    /// Payload does not fit the 32-bit length field
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A task run by the scheduler failed or was dropped before finishing
    #[error("Background task failed: {0}")]
    Background(String),
}

impl Error {
    /// Build a [`Error::FormatCorruption`]
    pub fn corruption(offset: u64, reason: impl Into<String>) -> Self {
        Error::FormatCorruption {
            offset,
            reason: reason.into(),
        }
    }

    /// True for errors caused by a violated on-disk layout
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::FormatCorruption { .. })
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
