#![forbid(unsafe_code)]

//! Identifiers, WAL records and the crate-wide error type.

use std::fmt;

use bytes::Bytes;
use xxhash_rust::xxh64::xxh64;

mod error;

pub use error::{NimbusError, Result};

/// Size of every page served by the page service.
pub const PAGE_SIZE: usize = 16 * 1024;

/// Owned image of one page.
pub type PageBuf = Box<[u8]>;

/// Identifier of one table's data/WAL stream.
///
/// Only the low 32 bits may be populated: [`page_key`] shifts the timeline
/// into the upper half of a `u64`, so anything wider would collide.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TimelineId(u64);

impl TimelineId {
    /// Largest raw value that survives packing into a page key.
    pub const MAX_RAW: u64 = u32::MAX as u64;

    /// Wraps a raw identifier, rejecting values that do not fit the key packing.
    pub fn new(raw: u64) -> Result<Self> {
        if raw > Self::MAX_RAW {
            return Err(NimbusError::Invalid(
                "timeline id exceeds 32 significant bits",
            ));
        }
        Ok(Self(raw))
    }

    /// Derives the timeline of a table from its fully qualified name.
    ///
    /// The 64-bit xxh64 digest is folded onto its low half, which keeps the
    /// value stable across processes and compatible with [`page_key`].
    pub fn from_table_name(name: &str) -> Self {
        let digest = xxh64(name.as_bytes(), 0);
        Self((digest >> 32) ^ (digest & Self::MAX_RAW))
    }

    /// Returns the raw identifier.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which remote service a connection talks to.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ServiceKind {
    /// Page-serving service.
    Page,
    /// WAL durability service.
    Log,
}

impl ServiceKind {
    /// Short lowercase name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceKind::Page => "page",
            ServiceKind::Log => "log",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log sequence number.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Lsn(pub u64);

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of one page within a timeline.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PageId {
    /// Owning timeline.
    pub timeline: TimelineId,
    /// Page number inside the timeline.
    pub page_number: u32,
}

impl PageId {
    /// Creates a page address.
    pub const fn new(timeline: TimelineId, page_number: u32) -> Self {
        Self {
            timeline,
            page_number,
        }
    }

    /// Packed cache key, see [`page_key`].
    pub fn key(&self) -> u64 {
        page_key(self)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.timeline, self.page_number)
    }
}

/// Packs a page address into `timeline << 32 | page_number`.
pub fn page_key(page_id: &PageId) -> u64 {
    (page_id.timeline.get() << 32) | u64::from(page_id.page_number)
}

/// One immutable write-ahead-log record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalRecord {
    lsn: Lsn,
    data: Bytes,
}

impl WalRecord {
    /// Builds a record. Payloads larger than `u32::MAX` bytes are rejected.
    pub fn new(lsn: Lsn, data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        if u32::try_from(data.len()).is_err() {
            return Err(NimbusError::Invalid("wal record larger than 4 GiB"));
        }
        Ok(Self { lsn, data })
    }

    /// Sequence number assigned by the owning session.
    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    /// Payload length in bytes.
    pub fn len(&self) -> u32 {
        // Bounded by the check in `new`.
        self.data.len() as u32
    }

    /// Returns true for an empty payload.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Record payload.
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}
