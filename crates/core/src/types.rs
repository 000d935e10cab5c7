//! Core types for rackdb
//!
//! This module defines the foundational identifier type:
//! - EntityKey: stable 128-bit identifier of a stored entity

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable 128-bit identifier of a stored entity
///
/// An EntityKey is a wrapper around a UUID v4. The all-zero key is
/// reserved: it names the record that holds the persisted table of
/// contents and is never handed out by [`EntityKey::new`] nor returned by
/// queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey(Uuid);

impl EntityKey {
    /// The reserved all-zero key
    pub const RESERVED: EntityKey = EntityKey(Uuid::nil());

    /// Create a new random EntityKey using UUID v4
    ///
    /// Never returns [`EntityKey::RESERVED`].
    pub fn new() -> Self {
        loop {
            let id = Uuid::new_v4();
            if !id.is_nil() {
                return Self(id);
            }
        }
    }

    /// Create an EntityKey from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parse an EntityKey from a string representation
    ///
    /// Accepts standard UUID format (with or without hyphens).
    ///
    /// # Errors
    /// Returns None if the string is not a valid UUID.
    pub fn from_string(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Get the raw bytes of this EntityKey
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// True for the all-zero key that holds the persisted TOC
    pub fn is_reserved(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for EntityKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EntityKey {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}
