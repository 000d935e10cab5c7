//! On-disk byte format of the record file.
//!
//! # File Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Slot 1: Header (36) + capacity     │
//! ├────────────────────────────────────┤
//! │ Slot 2: Header (36) + capacity     │
//! ├────────────────────────────────────┤
//! │ ...                                │
//! ├────────────────────────────────────┤
//! │ TOC record (key = 0), optional     │
//! ├────────────────────────────────────┤
//! │ TOC footer (16), optional          │
//! └────────────────────────────────────┘
//! ```
//!
//! # Header Layout
//!
//! ```text
//! ┌────────┬───────┬──────────┬──────────┬─────────┬────────┬──────────┬─────────┐
//! │ Marker │ Flags │ Reserved │ Key (16) │ Ver (4) │ Len (4)│ Cap (4)  │ CRC32(4)│
//! │ (1)    │ (1)   │ (2)      │          │         │        │          │         │
//! └────────┴───────┴──────────┴──────────┴─────────┴────────┴──────────┴─────────┘
//! ```
//!
//! `Len` is the number of payload bytes in use, `Cap` the number of payload
//! bytes the slot owns. A scan always advances by `Cap`, so an in-place
//! update with a shorter payload keeps every following header reachable.
//! The CRC covers the `Len` payload bytes only.

use byteorder::{ByteOrder, LittleEndian};
use rackdb_core::{EntityKey, Error, Result};

/// First byte of every record header
pub const RECORD_MARKER: u8 = 0xA7;

/// Size of a record header in bytes
pub const HEADER_SIZE: usize = 36;

/// Flag bit set while a record is live
pub const FLAG_IN_USE: u8 = 0x01;

/// Magic bytes identifying the TOC footer: "RKTC"
pub const FOOTER_MAGIC: [u8; 4] = *b"RKTC";

/// Size of the TOC footer in bytes
pub const FOOTER_SIZE: usize = 16;

/// Caller-supplied identity of a record being written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMeta {
    /// Entity key
    pub key: EntityKey,
    /// Store-wide version assigned to this write
    pub version: u32,
}

impl RecordMeta {
    /// Create record metadata
    pub fn new(key: EntityKey, version: u32) -> Self {
        RecordMeta { key, version }
    }
}

/// Fixed-size header preceding every payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Entity key; all-zero for the TOC record
    pub key: EntityKey,
    /// Store-wide version of the last write to this slot
    pub version: u32,
    /// Payload bytes in use
    pub length: u32,
    /// Payload bytes owned by the slot
    pub capacity: u32,
    /// False once tombstoned
    pub in_use: bool,
    /// CRC32 of the payload bytes
    pub checksum: u32,
}

impl RecordHeader {
    /// Total bytes occupied by this record's slot, header included
    pub fn slot_size(&self) -> u64 {
        HEADER_SIZE as u64 + self.capacity as u64
    }

    /// Serialize header to bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0] = RECORD_MARKER;
        bytes[1] = if self.in_use { FLAG_IN_USE } else { 0 };
        bytes[4..20].copy_from_slice(self.key.as_bytes());
        LittleEndian::write_u32(&mut bytes[20..24], self.version);
        LittleEndian::write_u32(&mut bytes[24..28], self.length);
        LittleEndian::write_u32(&mut bytes[28..32], self.capacity);
        LittleEndian::write_u32(&mut bytes[32..36], self.checksum);
        bytes
    }

    /// Deserialize header read at `offset`.
    ///
    /// # Errors
    ///
    /// `FormatCorruption` if the marker is wrong, unknown flag bits are set,
    /// or the length exceeds the capacity.
    pub fn from_bytes(offset: u64, bytes: &[u8; HEADER_SIZE]) -> Result<Self> {
        if bytes[0] != RECORD_MARKER {
            return Err(Error::corruption(
                offset,
                format!("bad record marker 0x{:02x}", bytes[0]),
            ));
        }
        if bytes[1] & !FLAG_IN_USE != 0 {
            return Err(Error::corruption(
                offset,
                format!("unknown header flags 0x{:02x}", bytes[1]),
            ));
        }

        let mut key = [0u8; 16];
        key.copy_from_slice(&bytes[4..20]);
        let header = RecordHeader {
            key: EntityKey::from_bytes(key),
            version: LittleEndian::read_u32(&bytes[20..24]),
            length: LittleEndian::read_u32(&bytes[24..28]),
            capacity: LittleEndian::read_u32(&bytes[28..32]),
            in_use: bytes[1] & FLAG_IN_USE != 0,
            checksum: LittleEndian::read_u32(&bytes[32..36]),
        };

        if header.length > header.capacity {
            return Err(Error::corruption(
                offset,
                format!(
                    "payload length {} exceeds slot capacity {}",
                    header.length, header.capacity
                ),
            ));
        }
        Ok(header)
    }
}

/// Compute the payload checksum stored in a header
pub fn payload_checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Trailer that locates the persisted TOC record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TocFooter {
    /// Offset of the key-zero TOC record
    pub toc_offset: u64,
}

impl TocFooter {
    /// Serialize footer to bytes.
    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut bytes = [0u8; FOOTER_SIZE];
        bytes[0..4].copy_from_slice(&FOOTER_MAGIC);
        LittleEndian::write_u64(&mut bytes[8..16], self.toc_offset);
        bytes
    }

    /// Deserialize footer; `None` unless the magic matches.
    pub fn from_bytes(bytes: &[u8; FOOTER_SIZE]) -> Option<Self> {
        if bytes[0..4] != FOOTER_MAGIC {
            return None;
        }
        Some(TocFooter {
            toc_offset: LittleEndian::read_u64(&bytes[8..16]),
        })
    }
}
