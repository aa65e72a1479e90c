use std::fmt;

use concord_types::{LockResource, RowKey, TransactionState, TxnId};
use thiserror::Error;

/// Why serializable validation refused a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SerializationReason {
    /// The transaction has both an incoming and an outgoing rw-antidependency.
    Pivot,
    /// The transaction read a row that a transaction committed after its
    /// snapshot has since overwritten.
    StaleRead,
    /// A committed reader with its own incoming edge points at this writer.
    CommittedPivot,
    /// Another committer already condemned this transaction as a pivot.
    MarkedForAbort,
}

impl SerializationReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pivot => "pivot",
            Self::StaleRead => "stale read",
            Self::CommittedPivot => "committed pivot",
            Self::MarkedForAbort => "marked for abort",
        }
    }
}

impl fmt::Display for SerializationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primary error type for the transaction engine.
///
/// Every variant that aborts the transaction is raised only after the engine
/// has already rolled it back; callers never clean up partial state.
#[derive(Error, Debug)]
pub enum EngineError {
    // === Recoverable (retry from the start) ===
    /// A lock request waited longer than its timeout. The transaction has
    /// been rolled back.
    #[error("lock wait timeout: {txn} waiting for {resource}")]
    LockTimeout { txn: TxnId, resource: LockResource },

    /// The transaction was chosen as a deadlock victim and rolled back.
    #[error("deadlock detected: {txn} chosen as victim")]
    Deadlock { txn: TxnId },

    /// Serializable validation found a dangerous structure; the transaction
    /// has been rolled back.
    #[error("could not serialize access: {txn} aborted ({reason})")]
    SerializationFailure {
        txn: TxnId,
        reason: SerializationReason,
    },

    // === Invariant Violations ===
    /// Another transaction's pending version already exists on this row.
    /// Unreachable under correct locking; the row is quarantined.
    #[error("write conflict on {row}: pending version held by {holder}")]
    WriteConflict { row: RowKey, holder: TxnId },

    /// The row was fenced off after a write conflict.
    #[error("row {row} is quarantined after an internal write conflict")]
    RowQuarantined { row: RowKey },

    // === Caller Errors ===
    /// Operation attempted on a transaction that is no longer active.
    #[error("{txn} is {state}; no further operations are permitted")]
    InvalidState {
        txn: TxnId,
        state: TransactionState,
    },

    /// The id was never handed out by this engine.
    #[error("unknown transaction: {txn}")]
    UnknownTransaction { txn: TxnId },

    /// Configuration rejected at construction time.
    #[error("invalid engine configuration: {detail}")]
    InvalidConfig { detail: String },

    // === Fatal ===
    /// The durability log failed to record a commit. The engine has stopped.
    #[error("durability log append failed for {txn}: {detail}")]
    DurabilityFailure { txn: TxnId, detail: String },

    /// The engine stopped after a previous fatal error.
    #[error("engine instance has failed and accepts no further work")]
    EngineFailed,

    /// The transaction id space is exhausted.
    #[error("transaction id space exhausted")]
    TxnIdExhausted,

    /// Internal logic error (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse numeric classification of [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Internal logic error.
    Internal = 2,
    /// Transaction rolled back by the engine.
    Abort = 4,
    /// Lock wait gave up.
    Busy = 5,
    /// Resource fenced off.
    Locked = 6,
    /// Durable storage failure.
    IoErr = 10,
    /// Library used incorrectly.
    Misuse = 21,
    /// Configuration out of range.
    Range = 25,
}

impl EngineError {
    /// Map this error to its numeric class.
    #[allow(clippy::match_same_arms)]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::LockTimeout { .. } => ErrorCode::Busy,
            Self::Deadlock { .. } | Self::SerializationFailure { .. } => ErrorCode::Abort,
            Self::WriteConflict { .. } | Self::Internal(_) => ErrorCode::Internal,
            Self::RowQuarantined { .. } => ErrorCode::Locked,
            Self::InvalidState { .. } | Self::UnknownTransaction { .. } => ErrorCode::Misuse,
            Self::InvalidConfig { .. } => ErrorCode::Range,
            Self::DurabilityFailure { .. } | Self::EngineFailed => ErrorCode::IoErr,
            Self::TxnIdExhausted => ErrorCode::Internal,
        }
    }

    /// Whether retrying the whole transaction may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. } | Self::Deadlock { .. } | Self::SerializationFailure { .. }
        )
    }

    /// Whether the error indicates a bug or an unusable engine instance.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::WriteConflict { .. }
                | Self::DurabilityFailure { .. }
                | Self::EngineFailed
                | Self::TxnIdExhausted
                | Self::Internal(_)
        )
    }

    /// Whether the engine rolled the transaction back before returning.
    pub const fn forces_abort(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. }
                | Self::Deadlock { .. }
                | Self::SerializationFailure { .. }
                | Self::WriteConflict { .. }
                | Self::RowQuarantined { .. }
                | Self::DurabilityFailure { .. }
        )
    }

    /// Human-friendly suggestion for handling this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::LockTimeout { .. } => {
                Some("Retry the transaction, or raise the lock timeout for long waits")
            }
            Self::Deadlock { .. } | Self::SerializationFailure { .. } => {
                Some("Retry the transaction from the beginning")
            }
            Self::InvalidState { .. } => Some("Begin a new transaction"),
            Self::WriteConflict { .. } | Self::RowQuarantined { .. } => {
                Some("Report this as a bug; the row needs manual inspection")
            }
            Self::DurabilityFailure { .. } | Self::EngineFailed => {
                Some("Restart the engine after repairing the durability log")
            }
            _ => None,
        }
    }

    /// The transaction the error is about, if any.
    pub const fn txn(&self) -> Option<TxnId> {
        match self {
            Self::LockTimeout { txn, .. }
            | Self::Deadlock { txn }
            | Self::SerializationFailure { txn, .. }
            | Self::InvalidState { txn, .. }
            | Self::UnknownTransaction { txn }
            | Self::DurabilityFailure { txn, .. } => Some(*txn),
            _ => None,
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a configuration error.
    pub fn invalid_config(detail: impl Into<String>) -> Self {
        Self::InvalidConfig {
            detail: detail.into(),
        }
    }
}

/// Result type alias using `EngineError`.
pub type Result<T> = std::result::Result<T, EngineError>;
