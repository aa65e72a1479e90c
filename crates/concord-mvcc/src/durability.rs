//! Collaborator interfaces: the durability log the engine writes commits to,
//! and the watermark source garbage collection consults.

use std::sync::atomic::{AtomicBool, Ordering};

use concord_types::{CommitTs, Payload, RowKey, TxnId};
use parking_lot::Mutex;
use thiserror::Error;

/// Final effect of a committed transaction on one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowChange {
    pub row: RowKey,
    /// `None` when the row was deleted.
    pub payload: Option<Payload>,
}

/// Error reported by a [`DurabilityLog`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{detail}")]
pub struct DurabilityError {
    detail: String,
}

impl DurabilityError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn detail(&self) -> &str {
        &self.detail
    }
}

/// Sink for committed changes.
///
/// `append` is called inside the commit critical section, after validation
/// and before any version becomes visible. Returning `Ok` promises the
/// record is durable. An error stops the engine.
pub trait DurabilityLog: Send + Sync {
    fn append(
        &self,
        txn: TxnId,
        commit_ts: CommitTs,
        changes: &[RowChange],
    ) -> Result<(), DurabilityError>;
}

/// Source of the reclamation watermark: no live snapshot is older.
pub trait GarbageCollector: Send + Sync {
    fn watermark(&self) -> CommitTs;
}

/// Log that accepts and forgets everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDurabilityLog;

impl DurabilityLog for NullDurabilityLog {
    fn append(&self, _: TxnId, _: CommitTs, _: &[RowChange]) -> Result<(), DurabilityError> {
        Ok(())
    }
}

/// One record of an [`InMemoryDurabilityLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub txn: TxnId,
    pub commit_ts: CommitTs,
    pub changes: Vec<RowChange>,
}

/// Log kept in memory, with failure injection for tests.
#[derive(Debug, Default)]
pub struct InMemoryDurabilityLog {
    records: Mutex<Vec<CommitRecord>>,
    fail_next: AtomicBool,
}

impl InMemoryDurabilityLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `append` fail.
    pub fn fail_next_append(&self) {
        self.fail_next.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn records(&self) -> Vec<CommitRecord> {
        self.records.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DurabilityLog for InMemoryDurabilityLog {
    fn append(
        &self,
        txn: TxnId,
        commit_ts: CommitTs,
        changes: &[RowChange],
    ) -> Result<(), DurabilityError> {
        if self.fail_next.swap(false, Ordering::AcqRel) {
            return Err(DurabilityError::new(format!(
                "injected append failure for {txn} at {commit_ts}"
            )));
        }
        self.records.lock().push(CommitRecord {
            txn,
            commit_ts,
            changes: changes.to_vec(),
        });
        Ok(())
    }
}
