//! Identifier and key types.
//!
//! Transaction ids double as logical ages (larger = younger). Commit
//! timestamps come from a separate global counter so that commit order and
//! timestamp order coincide even when transactions commit out of id order.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;

/// Monotonically increasing transaction identifier.
///
/// Domain: `1..=(2^62 - 1)`. Zero is never a valid id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TxnId(NonZeroU64);

impl TxnId {
    /// Maximum raw value representable by a real transaction id.
    pub const MAX_RAW: u64 = (1_u64 << 62) - 1;

    /// The first id handed out by a fresh engine.
    pub const FIRST: Self = Self(NonZeroU64::MIN);

    /// Construct a `TxnId` if `raw` is in-domain.
    #[inline]
    pub const fn new(raw: u64) -> Option<Self> {
        if raw > Self::MAX_RAW {
            return None;
        }
        match NonZeroU64::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0.get()
    }

    /// Return the next transaction id if it stays in-domain.
    #[inline]
    pub const fn checked_next(self) -> Option<Self> {
        Self::new(self.get().wrapping_add(1))
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.get())
    }
}

impl TryFrom<u64> for TxnId {
    type Error = InvalidTxnId;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidTxnId { raw: value })
    }
}

/// Error returned when attempting to construct an out-of-domain `TxnId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTxnId {
    raw: u64,
}

impl fmt::Display for InvalidTxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid TxnId {} (must satisfy 1 <= id <= {})",
            self.raw,
            TxnId::MAX_RAW
        )
    }
}

impl std::error::Error for InvalidTxnId {}

/// Value of the global commit counter.
///
/// Snapshots are expressed in the same unit: a snapshot at `ts` sees every
/// transaction whose commit timestamp is `<= ts`.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct CommitTs(u64);

impl CommitTs {
    /// Timestamp of the empty database: nothing has committed yet.
    pub const ZERO: Self = Self(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for CommitTs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts#{}", self.get())
    }
}

/// Identifier of a table (the coarsest lock granule).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TableId(u32);

impl TableId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table#{}", self.0)
    }
}

/// Logical row identifier: a table plus an ordered key within it.
///
/// Ordering is `(table, key)`, which is the order gap locks and range scans
/// rely on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct RowKey {
    pub table: TableId,
    pub key: u64,
}

impl RowKey {
    #[inline]
    pub const fn new(table: TableId, key: u64) -> Self {
        Self { table, key }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.key)
    }
}

/// Inclusive key range within one table, used for predicate reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct KeyRange {
    pub table: TableId,
    pub low: u64,
    pub high: u64,
}

impl KeyRange {
    /// Range `[low, high]` of `table`. An inverted range is empty.
    #[inline]
    pub const fn new(table: TableId, low: u64, high: u64) -> Self {
        Self { table, low, high }
    }

    /// Every key of `table`.
    #[inline]
    pub const fn all(table: TableId) -> Self {
        Self {
            table,
            low: 0,
            high: u64::MAX,
        }
    }

    /// Single-key range.
    #[inline]
    pub const fn point(row: RowKey) -> Self {
        Self {
            table: row.table,
            low: row.key,
            high: row.key,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.low > self.high
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, row: RowKey) -> bool {
        row.table == self.table && self.low <= row.key && row.key <= self.high
    }

    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.table == other.table
            && !self.is_empty()
            && !other.is_empty()
            && self.low <= other.high
            && other.low <= self.high
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}..={}]", self.table, self.low, self.high)
    }
}

/// Opaque row payload. Cheap to clone; the engine never inspects it.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Payload(Arc<[u8]>);

impl Payload {
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(Arc::from(bytes))
    }

    /// Encode a signed integer (little-endian, 8 bytes).
    #[must_use]
    pub fn from_i64(value: i64) -> Self {
        Self::from_bytes(&value.to_le_bytes())
    }

    /// Decode a payload written by [`Payload::from_i64`].
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        let bytes: [u8; 8] = self.0.as_ref().try_into().ok()?;
        Some(i64::from_le_bytes(bytes))
    }

    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self(Arc::from(value))
    }
}

impl From<&[u8]> for Payload {
    fn from(value: &[u8]) -> Self {
        Self::from_bytes(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::from_bytes(value.as_bytes())
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_i64() {
            Some(v) => write!(f, "Payload({v})"),
            None => write!(f, "Payload({} bytes)", self.0.len()),
        }
    }
}
