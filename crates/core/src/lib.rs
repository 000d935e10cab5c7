//! Core types and traits for rackdb
//!
//! This crate defines the foundational types used throughout the system:
//! - EntityKey: 128-bit identifier of a stored entity
//! - Value: scalar field value used by queries and indexes
//! - FieldPath: dotted path into an entity's document tree
//! - Error: Error type hierarchy
//! - Traits: collaborator contracts (Scheduler, Completion)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod path;
pub mod traits;
pub mod types;
pub mod value;

pub use error::{Error, Result};
pub use path::FieldPath;
pub use traits::{Completer, Completion, InlineScheduler, Scheduler, Task};
pub use types::EntityKey;
pub use value::Value;
