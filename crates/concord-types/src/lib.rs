//! Shared vocabulary of the concord transaction engine.
//!
//! Nothing in this crate carries policy: ids, keys, lock modes and the
//! closed enums the transaction manager matches on.

pub mod glossary;
pub mod lock_mode;

pub use glossary::{CommitTs, InvalidTxnId, KeyRange, Payload, RowKey, TableId, TxnId};
pub use lock_mode::{Gap, LockMode, LockResource};

use std::fmt;

/// Isolation level requested at `begin`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Default,
)]
pub enum IsolationLevel {
    /// Snapshot re-taken before every read.
    ReadCommitted,
    /// Snapshot fixed at begin.
    #[default]
    RepeatableRead,
    /// Fixed snapshot plus commit-time rw-antidependency validation.
    Serializable,
}

impl IsolationLevel {
    #[must_use]
    pub const fn fixed_snapshot(self) -> bool {
        match self {
            Self::ReadCommitted => false,
            Self::RepeatableRead | Self::Serializable => true,
        }
    }

    /// Whether reads are recorded for serializable validation.
    #[must_use]
    pub const fn tracks_reads(self) -> bool {
        matches!(self, Self::Serializable)
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        })
    }
}

/// Transaction lifecycle state.
///
/// `Active -> Preparing -> Committed`, or `Active | Preparing -> Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TransactionState {
    Active,
    Preparing,
    Committed,
    Aborted,
}

impl TransactionState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Preparing => "preparing",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        })
    }
}
