//! Storage layer for rackdb
//!
//! This crate owns the single record file and its index:
//! - format: header and footer byte layout
//! - RecordStore: slot writes, reads, tombstones, sequential scans
//! - Toc: key → slot map, persisted as the file's last record or
//!   rebuilt by scan in the background
//!
//! Nothing here knows about entity types or codecs; payloads are opaque bytes.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod format;
pub mod record_store;
pub mod toc;

pub use format::{RecordHeader, RecordMeta, HEADER_SIZE};
pub use record_store::{RecordReader, RecordStore, RecordStoreOptions, RecordWriter, ScanSummary};
pub use toc::{Toc, TocEntry, TocStats};
