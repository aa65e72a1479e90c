//! Transaction lifecycle: begin, read, write, commit, rollback.
//!
//! [`TransactionManager`] is the public façade. It assigns snapshots, routes
//! reads and writes to the [`VersionStore`], takes locks through the
//! [`LockManager`], records footprints in the [`ConflictTracker`], and owns
//! the commit critical section.
//!
//! Every error that forces an abort is returned only after the rollback has
//! happened, so callers never clean up partial state.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use concord_error::{EngineError, Result, SerializationReason};
use concord_observability::{ConflictEvent, ConflictObserver, MetricsObserver};
use concord_types::{
    CommitTs, Gap, IsolationLevel, KeyRange, LockMode, LockResource, Payload, RowKey, TableId,
    TransactionState, TxnId,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::conflict_tracker::ConflictTracker;
use crate::core_types::VersionHandle;
use crate::deadlock::{DeadlockDetector, VictimWeight};
use crate::durability::{DurabilityLog, GarbageCollector, RowChange};
use crate::gc::{GcScheduler, chain_pressure};
use crate::lock_manager::{LockManager, LockOutcome};
use crate::observability::{EventSink, record_ssi_abort};
use crate::version_store::{GcReport, LATEST, VersionStore};

// ---------------------------------------------------------------------------
// Per-transaction state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SlotInner {
    state: TransactionState,
    /// Rows with a pending version or pending delete by this transaction.
    write_set: BTreeSet<RowKey>,
}

#[derive(Debug)]
struct TxnSlot {
    id: TxnId,
    level: IsolationLevel,
    /// Refreshed before every read under ReadCommitted.
    snapshot: AtomicU64,
    /// `write_set.len()`, readable while lock-manager latches are held.
    write_count: AtomicUsize,
    started: Instant,
    inner: Mutex<SlotInner>,
}

impl TxnSlot {
    fn new(id: TxnId, level: IsolationLevel, snapshot: CommitTs) -> Self {
        Self {
            id,
            level,
            snapshot: AtomicU64::new(snapshot.get()),
            write_count: AtomicUsize::new(0),
            started: Instant::now(),
            inner: Mutex::new(SlotInner {
                state: TransactionState::Active,
                write_set: BTreeSet::new(),
            }),
        }
    }

    fn snapshot(&self) -> CommitTs {
        CommitTs::new(self.snapshot.load(Ordering::Acquire))
    }

    fn state(&self) -> TransactionState {
        self.inner.lock().state
    }
}

type SlotTable = RwLock<HashMap<TxnId, Arc<TxnSlot>>>;

/// Why a transaction was rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortCause {
    User,
    Deadlock,
    LockTimeout,
    Serialization,
    WriteConflict,
    Durability,
    /// The engine had already failed.
    EngineFailed,
    /// Engine bookkeeping was inconsistent, e.g. the conflict tracker had
    /// no record of the transaction.
    Internal,
}

impl AbortCause {
    const fn as_str(self) -> &'static str {
        match self {
            Self::User => "rollback",
            Self::Deadlock => "deadlock",
            Self::LockTimeout => "lock_timeout",
            Self::Serialization => "serialization_failure",
            Self::WriteConflict => "write_conflict",
            Self::Durability => "durability_failure",
            Self::EngineFailed => "engine_failed",
            Self::Internal => "internal",
        }
    }
}

/// Terminal states of recently finished transactions, oldest evicted first.
#[derive(Debug)]
struct OutcomeLog {
    states: HashMap<TxnId, TransactionState>,
    order: VecDeque<TxnId>,
    capacity: usize,
}

impl OutcomeLog {
    fn new(capacity: usize) -> Self {
        Self {
            states: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn record(&mut self, txn: TxnId, state: TransactionState) {
        if self.capacity == 0 {
            return;
        }
        if self.states.insert(txn, state).is_none() {
            self.order.push_back(txn);
        }
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.states.remove(&old);
            }
        }
    }

    fn get(&self, txn: TxnId) -> Option<TransactionState> {
        self.states.get(&txn).copied()
    }
}

#[derive(Debug, Default)]
struct AbortCounters {
    user: AtomicU64,
    deadlock: AtomicU64,
    lock_timeout: AtomicU64,
    serialization: AtomicU64,
    write_conflict: AtomicU64,
    durability: AtomicU64,
    internal: AtomicU64,
}

impl AbortCounters {
    fn record(&self, cause: AbortCause) {
        let counter = match cause {
            AbortCause::User => &self.user,
            AbortCause::Deadlock => &self.deadlock,
            AbortCause::LockTimeout => &self.lock_timeout,
            AbortCause::Serialization => &self.serialization,
            AbortCause::WriteConflict => &self.write_conflict,
            AbortCause::Durability | AbortCause::EngineFailed => &self.durability,
            AbortCause::Internal => &self.internal,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> AbortStats {
        AbortStats {
            user: self.user.load(Ordering::Relaxed),
            deadlock: self.deadlock.load(Ordering::Relaxed),
            lock_timeout: self.lock_timeout.load(Ordering::Relaxed),
            serialization: self.serialization.load(Ordering::Relaxed),
            write_conflict: self.write_conflict.load(Ordering::Relaxed),
            durability: self.durability.load(Ordering::Relaxed),
            internal: self.internal.load(Ordering::Relaxed),
        }
    }
}

/// Aborted transactions by cause.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AbortStats {
    pub user: u64,
    pub deadlock: u64,
    pub lock_timeout: u64,
    pub serialization: u64,
    pub write_conflict: u64,
    /// Includes transactions refused after a fail-stop.
    pub durability: u64,
    pub internal: u64,
}

impl AbortStats {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.user
            + self.deadlock
            + self.lock_timeout
            + self.serialization
            + self.write_conflict
            + self.durability
            + self.internal
    }
}

/// Point-in-time view of a [`TransactionManager`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub commit_ts: CommitTs,
    pub active: usize,
    pub committed: u64,
    pub aborted: AbortStats,
    pub versions: usize,
    pub rows: usize,
    pub locks: usize,
    pub quarantined_rows: usize,
    pub retained_footprints: usize,
    pub failed: bool,
}

// ---------------------------------------------------------------------------
// TransactionManager
// ---------------------------------------------------------------------------

/// Concurrency-control engine façade.
pub struct TransactionManager {
    config: EngineConfig,
    versions: VersionStore,
    locks: LockManager,
    tracker: ConflictTracker,
    log: Arc<dyn DurabilityLog>,
    sink: EventSink,
    metrics: Option<Arc<MetricsObserver>>,
    next_txn_id: AtomicU64,
    /// Timestamp of the newest committed transaction. Advanced only inside
    /// the commit critical section, after every version is finalized.
    commit_counter: AtomicU64,
    commit_lock: Mutex<()>,
    txns: Arc<SlotTable>,
    outcomes: Mutex<OutcomeLog>,
    failed: AtomicBool,
    committed: AtomicU64,
    aborted: AbortCounters,
    gc: Mutex<GcScheduler>,
    lock_timeout_ms: AtomicU64,
}

impl TransactionManager {
    /// Engine with the built-in [`MetricsObserver`].
    pub fn new(config: EngineConfig, log: Arc<dyn DurabilityLog>) -> Result<Self> {
        let metrics = Arc::new(MetricsObserver::new(config.event_log_capacity));
        let observer: Arc<dyn ConflictObserver> = metrics.clone();
        let mut engine = Self::build(config, log, Some(observer))?;
        engine.metrics = Some(metrics);
        Ok(engine)
    }

    /// Engine reporting to a caller-supplied observer instead of the
    /// built-in one.
    pub fn with_observer(
        config: EngineConfig,
        log: Arc<dyn DurabilityLog>,
        observer: Option<Arc<dyn ConflictObserver>>,
    ) -> Result<Self> {
        Self::build(config, log, observer)
    }

    fn build(
        config: EngineConfig,
        log: Arc<dyn DurabilityLog>,
        observer: Option<Arc<dyn ConflictObserver>>,
    ) -> Result<Self> {
        config.validate()?;
        let sink = EventSink::new(observer);
        let txns = Arc::new(RwLock::new(HashMap::new()));
        let detector = config
            .deadlock_detection
            .then(|| Self::detector(&config, &sink, &txns));
        info!(
            lock_timeout_ms = config.lock_timeout_ms,
            deadlock_detection = config.deadlock_detection,
            auto_gc = config.auto_gc,
            "transaction manager created"
        );
        Ok(Self {
            versions: VersionStore::new(),
            locks: LockManager::with_detector(detector, config.deadlock_recheck(), sink.clone()),
            tracker: ConflictTracker::new(sink.clone()),
            log,
            sink,
            metrics: None,
            next_txn_id: AtomicU64::new(TxnId::FIRST.get()),
            commit_counter: AtomicU64::new(0),
            commit_lock: Mutex::new(()),
            txns,
            outcomes: Mutex::new(OutcomeLog::new(config.outcome_retention)),
            failed: AtomicBool::new(false),
            committed: AtomicU64::new(0),
            aborted: AbortCounters::default(),
            gc: Mutex::new(GcScheduler::from_config(&config)),
            lock_timeout_ms: AtomicU64::new(config.lock_timeout_ms),
            config,
        })
    }

    /// Detector whose victims are the cycle members with the fewest pending
    /// writes.
    fn detector(
        config: &EngineConfig,
        sink: &EventSink,
        txns: &Arc<SlotTable>,
    ) -> DeadlockDetector {
        let txns = Arc::clone(txns);
        let weight: VictimWeight = Arc::new(move |txn: TxnId| {
            txns.read()
                .get(&txn)
                .map_or(0, |slot| slot.write_count.load(Ordering::Acquire))
        });
        DeadlockDetector::new(config.deadlock_max_graph_size, sink.clone()).with_weight(weight)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn versions(&self) -> &VersionStore {
        &self.versions
    }

    #[must_use]
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    #[must_use]
    pub fn tracker(&self) -> &ConflictTracker {
        &self.tracker
    }

    /// The built-in observer, when the engine was created with [`Self::new`].
    #[must_use]
    pub fn metrics_observer(&self) -> Option<&Arc<MetricsObserver>> {
        self.metrics.as_ref()
    }

    /// Newest commit timestamp.
    #[must_use]
    pub fn commit_ts(&self) -> CommitTs {
        CommitTs::new(self.commit_counter.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn lock_timeout_ms(&self) -> u64 {
        self.lock_timeout_ms.load(Ordering::Relaxed)
    }

    /// Change the lock wait timeout for subsequent requests. Clamped to at
    /// least 1ms.
    pub fn set_lock_timeout_ms(&self, ms: u64) {
        self.lock_timeout_ms.store(ms.max(1), Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Current state of `txn`, if it is live or was recently finished.
    #[must_use]
    pub fn state(&self, txn: TxnId) -> Option<TransactionState> {
        if let Some(slot) = self.txns.read().get(&txn) {
            return Some(slot.state());
        }
        self.outcomes.lock().get(txn)
    }

    /// Snapshot `txn` currently reads at.
    #[must_use]
    pub fn snapshot_of(&self, txn: TxnId) -> Option<CommitTs> {
        self.txns.read().get(&txn).map(|s| s.snapshot())
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.txns.read().len()
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            commit_ts: self.commit_ts(),
            active: self.active_count(),
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.snapshot(),
            versions: self.versions.version_count(),
            rows: self.versions.row_count(),
            locks: self.locks.lock_count(),
            quarantined_rows: self.versions.quarantined_rows().len(),
            retained_footprints: self.tracker.retained_count(),
            failed: self.is_failed(),
        }
    }

    // -----------------------------------------------------------------------
    // Begin
    // -----------------------------------------------------------------------

    fn alloc_txn_id(&self) -> Result<TxnId> {
        let raw = self
            .next_txn_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n <= TxnId::MAX_RAW).then_some(n + 1)
            })
            .map_err(|_| EngineError::TxnIdExhausted)?;
        TxnId::new(raw).ok_or(EngineError::TxnIdExhausted)
    }

    /// Start a transaction. The snapshot is the current commit counter.
    pub fn begin(&self, level: IsolationLevel) -> Result<TxnId> {
        self.ensure_running()?;
        let id = self.alloc_txn_id()?;
        let snapshot = {
            // Registered under the same latch the watermark is computed
            // under, so GC never reclaims below a snapshot being handed out.
            let mut txns = self.txns.write();
            let snapshot = self.commit_ts();
            txns.insert(id, Arc::new(TxnSlot::new(id, level, snapshot)));
            snapshot
        };
        self.tracker.register(id, level, snapshot);
        info!(txn_id = %id, %level, %snapshot, "transaction begun");
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Read `row`.
    ///
    /// A non-locking read uses the transaction's snapshot (refreshed first
    /// under ReadCommitted). A locking read takes a Shared row lock (plus
    /// the gap below the row under Serializable) and returns the latest
    /// committed value, bypassing the snapshot. Own writes are always
    /// visible.
    pub fn read(&self, txn: TxnId, row: RowKey, locking: bool) -> Result<Option<Payload>> {
        let slot = self.active_slot(txn)?;
        self.check_marked(&slot)?;
        self.check_quarantine(&slot, row)?;

        if locking {
            self.lock(&slot, LockResource::Row(row), LockMode::Shared)?;
            if slot.level == IsolationLevel::Serializable {
                self.lock(&slot, LockResource::Gap(Gap::below(row)), LockMode::Shared)?;
            }
            let value = self.versions.read_latest(row, Some(txn));
            debug!(txn_id = %txn, %row, found = value.is_some(), "locking read");
            return Ok(value);
        }

        let snapshot = self.read_snapshot(&slot);
        self.tracker.record_read(txn, row);
        Ok(self.versions.read_as(row, snapshot, Some(txn)))
    }

    /// Visible rows of `range` in key order.
    ///
    /// Non-locking scans read the snapshot and, under Serializable, record
    /// the range as a predicate read. Locking scans take next-key locks
    /// (each key plus the gap below it, plus the gap above the range) and
    /// return the latest committed rows.
    pub fn scan(
        &self,
        txn: TxnId,
        range: KeyRange,
        locking: bool,
    ) -> Result<Vec<(RowKey, Payload)>> {
        let slot = self.active_slot(txn)?;
        self.check_marked(&slot)?;
        if range.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(row) = self.versions.quarantined_in(range) {
            return Err(self.quarantine_abort(&slot, row));
        }

        if locking {
            self.lock_range(&slot, range)?;
            let rows = self.versions.scan(range, LATEST, Some(txn));
            debug!(txn_id = %txn, %range, rows = rows.len(), "locking scan");
            return Ok(rows);
        }

        let snapshot = self.read_snapshot(&slot);
        self.tracker.record_range(txn, range);
        Ok(self.versions.scan(range, snapshot, Some(txn)))
    }

    fn read_snapshot(&self, slot: &TxnSlot) -> CommitTs {
        match slot.level {
            IsolationLevel::ReadCommitted => {
                let fresh = self.commit_ts();
                let old = slot.snapshot.swap(fresh.get(), Ordering::AcqRel);
                if old != fresh.get() {
                    debug!(txn_id = %slot.id, from = old, to = %fresh, "snapshot refreshed");
                }
                fresh
            }
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => slot.snapshot(),
        }
    }

    /// Shared next-key locks over `range`, repeated until the set of keys
    /// the locks cover stops changing.
    fn lock_range(&self, slot: &TxnSlot, range: KeyRange) -> Result<()> {
        let table = range.table;
        loop {
            let keys = self.versions.keys_in(range);
            let above = self.versions.next_key(table, range.high);
            for &key in &keys {
                let row = RowKey::new(table, key);
                self.lock(slot, LockResource::Row(row), LockMode::Shared)?;
                self.lock(slot, LockResource::Gap(Gap::below(row)), LockMode::Shared)?;
            }
            let top = above.map_or(Gap::supremum(table), |k| Gap::below(RowKey::new(table, k)));
            self.lock(slot, LockResource::Gap(top), LockMode::Shared)?;

            let stable = self.versions.keys_in(range) == keys
                && self.versions.next_key(table, range.high) == above;
            if stable {
                return Ok(());
            }
            debug!(txn_id = %slot.id, %range, "key set moved while locking; retrying");
        }
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Write `payload` to `row` under an Exclusive row lock.
    pub fn write(&self, txn: TxnId, row: RowKey, payload: Payload) -> Result<()> {
        let slot = self.active_slot(txn)?;
        self.check_marked(&slot)?;
        self.check_quarantine(&slot, row)?;
        self.lock(&slot, LockResource::Row(row), LockMode::Exclusive)?;
        if !self.versions.contains(row) {
            self.lock_insert_gap(&slot, row)?;
        }

        let written = self.with_active(&slot, |inner| {
            let result = self.versions.write(row, txn, payload);
            if result.is_ok() {
                inner.write_set.insert(row);
            }
            result
        })?;
        match written {
            Ok(_) => {
                self.tracker.record_write(txn, row);
                debug!(txn_id = %txn, %row, "row written");
                Ok(())
            }
            Err(err) => Err(self.on_store_error(&slot, row, err)),
        }
    }

    /// Delete `row`. Returns `false` when there was nothing visible to
    /// delete.
    pub fn delete(&self, txn: TxnId, row: RowKey) -> Result<bool> {
        let slot = self.active_slot(txn)?;
        self.check_marked(&slot)?;
        self.check_quarantine(&slot, row)?;
        self.lock(&slot, LockResource::Row(row), LockMode::Exclusive)?;

        let deleted = self.with_active(&slot, |inner| {
            let result = self.versions.delete(row, txn);
            if matches!(result, Ok(Some(_))) {
                inner.write_set.insert(row);
            }
            result
        })?;
        match deleted {
            Ok(Some(_)) => {
                self.tracker.record_write(txn, row);
                debug!(txn_id = %txn, %row, "row deleted");
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(err) => Err(self.on_store_error(&slot, row, err)),
        }
    }

    /// Insert intention: IX on the gap a new key falls into, so inserts
    /// queue behind Shared gap locks held by locking scans.
    fn lock_insert_gap(&self, slot: &TxnSlot, row: RowKey) -> Result<()> {
        loop {
            let next = self.versions.next_key(row.table, row.key);
            let gap = next.map_or(Gap::supremum(row.table), |k| {
                Gap::below(RowKey::new(row.table, k))
            });
            self.lock(slot, LockResource::Gap(gap), LockMode::IntentionExclusive)?;
            if self.versions.next_key(row.table, row.key) == next {
                return Ok(());
            }
        }
    }

    /// Lock a whole table.
    pub fn lock_table(&self, txn: TxnId, table: TableId, mode: LockMode) -> Result<()> {
        let slot = self.active_slot(txn)?;
        self.check_marked(&slot)?;
        self.lock(&slot, LockResource::Table(table), mode)
    }

    fn lock(&self, slot: &TxnSlot, resource: LockResource, mode: LockMode) -> Result<()> {
        let timeout = Duration::from_millis(self.lock_timeout_ms());
        match self.locks.acquire(slot.id, resource, mode, timeout) {
            LockOutcome::Granted => {
                let state = slot.state();
                if state == TransactionState::Active {
                    return Ok(());
                }
                // Rolled back while queued; the grant must not outlive it.
                self.locks.release_all(slot.id);
                Err(EngineError::InvalidState {
                    txn: slot.id,
                    state,
                })
            }
            LockOutcome::Cancelled => Err(EngineError::InvalidState {
                txn: slot.id,
                state: slot.state(),
            }),
            LockOutcome::TimedOut => Err(self.abort_with(
                slot,
                EngineError::LockTimeout {
                    txn: slot.id,
                    resource,
                },
                AbortCause::LockTimeout,
            )),
            LockOutcome::Aborted => Err(self.abort_with(
                slot,
                EngineError::Deadlock { txn: slot.id },
                AbortCause::Deadlock,
            )),
        }
    }

    /// Run `f` under the slot latch if `slot` is still Active. A concurrent
    /// rollback either happens before, and `f` never runs, or after, and
    /// sees everything `f` added to the write set.
    fn with_active<T>(&self, slot: &TxnSlot, f: impl FnOnce(&mut SlotInner) -> T) -> Result<T> {
        let mut inner = slot.inner.lock();
        if inner.state == TransactionState::Active {
            let out = f(&mut inner);
            slot.write_count.store(inner.write_set.len(), Ordering::Release);
            return Ok(out);
        }
        let state = inner.state;
        drop(inner);
        self.locks.release_all(slot.id);
        Err(EngineError::InvalidState {
            txn: slot.id,
            state,
        })
    }

    fn on_store_error(&self, slot: &TxnSlot, row: RowKey, err: EngineError) -> EngineError {
        let EngineError::WriteConflict { holder, .. } = err else {
            error!(txn_id = %slot.id, %row, error = %err, "version store rejected write");
            return self.abort_with(slot, err, AbortCause::WriteConflict);
        };
        // Two pending writers on one row means the row lock was bypassed.
        if self.versions.quarantine(row) {
            error!(
                txn_id = %slot.id,
                %row,
                holder = %holder,
                "write conflict despite exclusive lock; row quarantined"
            );
            self.sink.emit(|ts| ConflictEvent::RowQuarantined {
                row,
                txn: slot.id,
                holder,
                timestamp_ns: ts,
            });
        }
        self.abort_with(slot, err, AbortCause::WriteConflict)
    }

    // -----------------------------------------------------------------------
    // Commit / rollback
    // -----------------------------------------------------------------------

    /// Commit `txn`, returning its commit timestamp.
    ///
    /// Under Serializable the transaction is validated first. The
    /// durability log is appended to before any version becomes visible;
    /// if it fails the engine stops.
    pub fn commit(&self, txn: TxnId) -> Result<CommitTs> {
        let slot = self.active_slot(txn)?;
        {
            let mut inner = slot.inner.lock();
            if inner.state != TransactionState::Active {
                return Err(EngineError::InvalidState {
                    txn,
                    state: inner.state,
                });
            }
            inner.state = TransactionState::Preparing;
        }

        if self.locks.is_victim(txn) {
            return Err(self.abort_with(&slot, EngineError::Deadlock { txn }, AbortCause::Deadlock));
        }

        let guard = self.commit_lock.lock();
        if self.is_failed() {
            drop(guard);
            return Err(self.abort_with(&slot, EngineError::EngineFailed, AbortCause::EngineFailed));
        }

        let commit_ts = self.commit_ts().next();
        let validation = match self.tracker.validate(txn, commit_ts) {
            Ok(v) => v,
            Err(err) => {
                drop(guard);
                let cause = match err {
                    EngineError::SerializationFailure { .. } => AbortCause::Serialization,
                    _ => AbortCause::Internal,
                };
                return Err(self.abort_with(&slot, err, cause));
            }
        };

        let rows: Vec<RowKey> = slot.inner.lock().write_set.iter().copied().collect();
        if !rows.is_empty() {
            let changes: Vec<RowChange> = rows
                .iter()
                .map(|&row| RowChange {
                    row,
                    payload: self.versions.read_latest(row, Some(txn)),
                })
                .collect();
            if let Err(err) = self.log.append(txn, commit_ts, &changes) {
                self.failed.store(true, Ordering::Release);
                error!(
                    txn_id = %txn,
                    %commit_ts,
                    error = %err,
                    "durability log append failed; engine stopped"
                );
                drop(guard);
                return Err(self.abort_with(
                    &slot,
                    EngineError::DurabilityFailure {
                        txn,
                        detail: err.detail().to_owned(),
                    },
                    AbortCause::Durability,
                ));
            }
        }

        for &row in &rows {
            self.versions.finalize(VersionHandle { row_key: row, txn }, commit_ts);
        }
        // Visibility flips here: snapshots taken from now on include every
        // version finalized above.
        self.commit_counter.store(commit_ts.get(), Ordering::Release);
        self.tracker.publish(txn, commit_ts, &validation);
        drop(guard);

        slot.inner.lock().state = TransactionState::Committed;
        self.txns.write().remove(&txn);
        let released = self.locks.release_all(txn);
        self.outcomes.lock().record(txn, TransactionState::Committed);
        self.committed.fetch_add(1, Ordering::Relaxed);

        info!(
            txn_id = %txn,
            %commit_ts,
            rows_written = rows.len(),
            locks_released = released,
            elapsed_us = u64::try_from(slot.started.elapsed().as_micros()).unwrap_or(u64::MAX),
            "transaction committed"
        );
        self.sink.emit(|ts| ConflictEvent::Committed {
            txn,
            commit_ts,
            rows_written: rows.len(),
            timestamp_ns: ts,
        });

        self.maybe_collect_garbage();
        Ok(commit_ts)
    }

    /// Abort `txn`. Idempotent; unknown and finished transactions are
    /// ignored, as are transactions already inside commit.
    pub fn rollback(&self, txn: TxnId) {
        let slot = self.txns.read().get(&txn).cloned();
        if let Some(slot) = slot {
            self.abort_internal(&slot, AbortCause::User);
        }
    }

    fn abort_with(&self, slot: &TxnSlot, err: EngineError, cause: AbortCause) -> EngineError {
        self.abort_internal(slot, cause);
        err
    }

    fn abort_internal(&self, slot: &TxnSlot, cause: AbortCause) {
        let rows = {
            let mut inner = slot.inner.lock();
            if inner.state.is_terminal()
                || (cause == AbortCause::User && inner.state == TransactionState::Preparing)
            {
                return;
            }
            inner.state = TransactionState::Aborted;
            slot.write_count.store(0, Ordering::Release);
            std::mem::take(&mut inner.write_set)
        };

        // Pending versions go before the locks protecting them.
        for &row in &rows {
            self.versions.discard(VersionHandle {
                row_key: row,
                txn: slot.id,
            });
        }
        self.tracker.remove(slot.id);
        self.txns.write().remove(&slot.id);
        let released = self.locks.release_all(slot.id);
        self.outcomes.lock().record(slot.id, TransactionState::Aborted);
        self.aborted.record(cause);

        info!(
            txn_id = %slot.id,
            cause = cause.as_str(),
            rows_discarded = rows.len(),
            locks_released = released,
            "transaction aborted"
        );
    }

    // -----------------------------------------------------------------------
    // Guards
    // -----------------------------------------------------------------------

    fn ensure_running(&self) -> Result<()> {
        if self.is_failed() {
            return Err(EngineError::EngineFailed);
        }
        Ok(())
    }

    /// The live slot of `txn`, which must be Active.
    fn active_slot(&self, txn: TxnId) -> Result<Arc<TxnSlot>> {
        let slot = self.txns.read().get(&txn).cloned();
        let Some(slot) = slot else {
            return Err(match self.outcomes.lock().get(txn) {
                Some(state) => EngineError::InvalidState { txn, state },
                None => EngineError::UnknownTransaction { txn },
            });
        };
        if self.is_failed() {
            return Err(self.abort_with(&slot, EngineError::EngineFailed, AbortCause::EngineFailed));
        }
        match slot.state() {
            TransactionState::Active => Ok(slot),
            state => Err(EngineError::InvalidState { txn, state }),
        }
    }

    /// Fail a Serializable transaction some committer marked as a pivot.
    fn check_marked(&self, slot: &TxnSlot) -> Result<()> {
        if slot.level != IsolationLevel::Serializable || !self.tracker.is_marked(slot.id) {
            return Ok(());
        }
        record_ssi_abort();
        warn!(txn_id = %slot.id, "transaction marked for abort by a concurrent committer");
        Err(self.abort_with(
            slot,
            EngineError::SerializationFailure {
                txn: slot.id,
                reason: SerializationReason::MarkedForAbort,
            },
            AbortCause::Serialization,
        ))
    }

    fn check_quarantine(&self, slot: &TxnSlot, row: RowKey) -> Result<()> {
        if !self.versions.is_quarantined(row) {
            return Ok(());
        }
        Err(self.quarantine_abort(slot, row))
    }

    fn quarantine_abort(&self, slot: &TxnSlot, row: RowKey) -> EngineError {
        warn!(txn_id = %slot.id, %row, "access to quarantined row");
        self.abort_with(slot, EngineError::RowQuarantined { row }, AbortCause::WriteConflict)
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Oldest snapshot any active transaction can read at, or the commit
    /// counter when none is active.
    #[must_use]
    pub fn watermark(&self) -> CommitTs {
        let txns = self.txns.read();
        let now = self.commit_ts();
        txns.values().map(|s| s.snapshot()).min().unwrap_or(now).min(now)
    }

    /// Reclaim versions and footprints below the watermark.
    ///
    /// Dead rows are purged only when no lock names the row or the gap
    /// below it.
    pub fn collect_garbage(&self) -> GcReport {
        let watermark = self.watermark();
        let report = self.versions.gc(watermark, |row| {
            !self.locks.is_referenced(LockResource::Row(row))
                && !self.locks.is_referenced(LockResource::Gap(Gap::below(row)))
        });
        let pruned = self.tracker.prune(watermark);
        debug!(
            %watermark,
            versions_reclaimed = report.versions_reclaimed,
            rows_purged = report.rows_purged,
            footprints_pruned = pruned,
            "garbage collected"
        );
        report
    }

    fn maybe_collect_garbage(&self) {
        if !self.config.auto_gc {
            return;
        }
        let Some(mut sched) = self.gc.try_lock() else {
            return;
        };
        let pressure = chain_pressure(self.versions.version_count(), self.versions.row_count());
        if sched.should_tick(pressure, Instant::now()) {
            drop(sched);
            self.collect_garbage();
        }
    }

    /// Break every deadlock cycle currently in the wait-for graph. Returns
    /// the victims; their pending lock requests fail with `Deadlock`.
    pub fn sweep_deadlocks(&self) -> Vec<TxnId> {
        Self::detector(&self.config, &self.sink, &self.txns).sweep(&self.locks)
    }
}

impl GarbageCollector for TransactionManager {
    fn watermark(&self) -> CommitTs {
        Self::watermark(self)
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("commit_ts", &self.commit_ts())
            .field("active", &self.active_count())
            .field("failed", &self.is_failed())
            .finish_non_exhaustive()
    }
}
