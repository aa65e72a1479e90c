//! Lock-wait and conflict observability for the concord engine.
//!
//! Observation is opt-in via the [`ConflictObserver`] trait. Observers are
//! called on the lock and commit paths and must not block or call back into
//! the engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use concord_types::{CommitTs, LockMode, LockResource, RowKey, TxnId};
use parking_lot::Mutex;
use serde::Serialize;

// ---------------------------------------------------------------------------
// ConflictEvent
// ---------------------------------------------------------------------------

/// A single event emitted by the lock manager, deadlock detector or
/// transaction manager.
///
/// Each variant carries enough context to reconstruct what happened without
/// access to engine internals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConflictEvent {
    /// A lock request could not be granted immediately and was queued.
    LockWait {
        resource: LockResource,
        requester: TxnId,
        mode: LockMode,
        /// First incompatible holder at enqueue time, if any.
        blocker: Option<TxnId>,
        /// Monotonic event timestamp (nanoseconds since observer creation).
        timestamp_ns: u64,
    },

    /// A queued lock request gave up after its timeout.
    LockTimeout {
        resource: LockResource,
        txn: TxnId,
        waited_ms: u64,
        timestamp_ns: u64,
    },

    /// The deadlock detector broke a cycle by condemning `victim`.
    DeadlockVictim {
        victim: TxnId,
        /// Transactions on the cycle, including the victim.
        cycle: Vec<TxnId>,
        timestamp_ns: u64,
    },

    /// Serializable validation aborted a transaction.
    SsiAbort {
        txn: TxnId,
        reason: SsiAbortCategory,
        in_edge_count: usize,
        out_edge_count: usize,
        timestamp_ns: u64,
    },

    /// A row was fenced after an internal write conflict.
    RowQuarantined {
        row: RowKey,
        txn: TxnId,
        holder: TxnId,
        timestamp_ns: u64,
    },

    /// A transaction committed.
    Committed {
        txn: TxnId,
        commit_ts: CommitTs,
        rows_written: usize,
        timestamp_ns: u64,
    },
}

/// Categorized SSI abort reason (serialization-friendly).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SsiAbortCategory {
    /// Transaction is the pivot (has both in + out rw edges).
    Pivot,
    /// Transaction read a row already overwritten by a later committer.
    StaleRead,
    /// A committed reader has an incoming rw edge.
    CommittedPivot,
    /// Transaction was eagerly marked for abort.
    MarkedForAbort,
}

impl ConflictEvent {
    /// Extract the monotonic timestamp from any event variant.
    #[must_use]
    pub fn timestamp_ns(&self) -> u64 {
        match self {
            Self::LockWait { timestamp_ns, .. }
            | Self::LockTimeout { timestamp_ns, .. }
            | Self::DeadlockVictim { timestamp_ns, .. }
            | Self::SsiAbort { timestamp_ns, .. }
            | Self::RowQuarantined { timestamp_ns, .. }
            | Self::Committed { timestamp_ns, .. } => *timestamp_ns,
        }
    }

    /// Whether this event represents a conflict rather than a success.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        !matches!(self, Self::Committed { .. })
    }
}

// ---------------------------------------------------------------------------
// ConflictObserver
// ---------------------------------------------------------------------------

/// Observer trait for conflict events.
///
/// Implementations MUST be non-blocking and MUST NOT call into the engine.
pub trait ConflictObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &ConflictEvent);
}

/// Observer that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpObserver;

impl ConflictObserver for NoOpObserver {
    #[inline(always)]
    fn on_event(&self, _event: &ConflictEvent) {}
}

// ---------------------------------------------------------------------------
// ConflictRingBuffer
// ---------------------------------------------------------------------------

/// Fixed-capacity ring buffer of recent events. The oldest event is
/// overwritten when full.
pub struct ConflictRingBuffer {
    events: Mutex<RingBuf>,
}

struct RingBuf {
    buf: Vec<ConflictEvent>,
    capacity: usize,
    head: usize,
    len: usize,
}

impl RingBuf {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, event: ConflictEvent) {
        if self.capacity == 0 {
            return;
        }
        if self.buf.len() < self.capacity {
            self.buf.push(event);
            self.len += 1;
            return;
        }
        self.buf[self.head] = event;
        self.head = (self.head + 1) % self.capacity;
    }

    fn ordered(&self) -> Vec<ConflictEvent> {
        (0..self.len)
            .map(|i| self.buf[(self.head + i) % self.capacity].clone())
            .collect()
    }

    fn clear(&mut self) {
        self.buf.clear();
        self.head = 0;
        self.len = 0;
    }
}

impl ConflictRingBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(RingBuf::new(capacity)),
        }
    }

    pub fn push(&self, event: ConflictEvent) {
        self.events.lock().push(event);
    }

    /// All stored events, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConflictEvent> {
        self.events.lock().ordered()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.events.lock().capacity
    }
}

// ---------------------------------------------------------------------------
// ConflictMetrics
// ---------------------------------------------------------------------------

/// Aggregated counters over observed events.
pub struct ConflictMetrics {
    /// Every event except `Committed`.
    pub conflicts_total: AtomicU64,
    pub lock_waits: AtomicU64,
    pub lock_timeouts: AtomicU64,
    pub deadlock_victims: AtomicU64,
    pub ssi_aborts: AtomicU64,
    pub quarantines: AtomicU64,
    pub commits: AtomicU64,
    /// Per-resource wait counts (behind a mutex, off the fast path).
    hotspots: Mutex<HashMap<LockResource, u64>>,
    created_at: Instant,
}

impl ConflictMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            conflicts_total: AtomicU64::new(0),
            lock_waits: AtomicU64::new(0),
            lock_timeouts: AtomicU64::new(0),
            deadlock_victims: AtomicU64::new(0),
            ssi_aborts: AtomicU64::new(0),
            quarantines: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            hotspots: Mutex::new(HashMap::new()),
            created_at: Instant::now(),
        }
    }

    /// Record an event, updating all relevant counters.
    pub fn record(&self, event: &ConflictEvent) {
        if event.is_conflict() {
            self.conflicts_total.fetch_add(1, Ordering::Relaxed);
        }
        match event {
            ConflictEvent::LockWait { resource, .. } => {
                self.lock_waits.fetch_add(1, Ordering::Relaxed);
                *self.hotspots.lock().entry(*resource).or_insert(0) += 1;
            }
            ConflictEvent::LockTimeout { .. } => {
                self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            ConflictEvent::DeadlockVictim { .. } => {
                self.deadlock_victims.fetch_add(1, Ordering::Relaxed);
            }
            ConflictEvent::SsiAbort { .. } => {
                self.ssi_aborts.fetch_add(1, Ordering::Relaxed);
            }
            ConflictEvent::RowQuarantined { .. } => {
                self.quarantines.fetch_add(1, Ordering::Relaxed);
            }
            ConflictEvent::Committed { .. } => {
                self.commits.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.conflicts_total,
            &self.lock_waits,
            &self.lock_timeouts,
            &self.deadlock_victims,
            &self.ssi_aborts,
            &self.quarantines,
            &self.commits,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.hotspots.lock().clear();
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Top `n` resources by wait count.
    #[must_use]
    pub fn top_hotspots(&self, n: usize) -> Vec<(LockResource, u64)> {
        let mut entries: Vec<(LockResource, u64)> = {
            let map = self.hotspots.lock();
            map.iter().map(|(&k, &v)| (k, v)).collect()
        };
        entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        entries.truncate(n);
        entries
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> ConflictMetricsSnapshot {
        let elapsed_secs = self.created_at.elapsed().as_secs_f64();
        let conflicts_total = self.conflicts_total.load(Ordering::Relaxed);
        ConflictMetricsSnapshot {
            conflicts_total,
            lock_waits: self.lock_waits.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            deadlock_victims: self.deadlock_victims.load(Ordering::Relaxed),
            ssi_aborts: self.ssi_aborts.load(Ordering::Relaxed),
            quarantines: self.quarantines.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            conflicts_per_second: if elapsed_secs < f64::EPSILON {
                0.0
            } else {
                conflicts_total as f64 / elapsed_secs
            },
            elapsed_secs,
            top_hotspots: self.top_hotspots(10),
        }
    }
}

impl Default for ConflictMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable snapshot of [`ConflictMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct ConflictMetricsSnapshot {
    pub conflicts_total: u64,
    pub lock_waits: u64,
    pub lock_timeouts: u64,
    pub deadlock_victims: u64,
    pub ssi_aborts: u64,
    pub quarantines: u64,
    pub commits: u64,
    pub conflicts_per_second: f64,
    pub elapsed_secs: f64,
    pub top_hotspots: Vec<(LockResource, u64)>,
}

// ---------------------------------------------------------------------------
// MetricsObserver
// ---------------------------------------------------------------------------

/// Observer that feeds both a [`ConflictMetrics`] aggregator and a
/// [`ConflictRingBuffer`].
pub struct MetricsObserver {
    metrics: ConflictMetrics,
    log: ConflictRingBuffer,
    epoch: Instant,
}

impl MetricsObserver {
    #[must_use]
    pub fn new(log_capacity: usize) -> Self {
        Self {
            metrics: ConflictMetrics::new(),
            log: ConflictRingBuffer::new(log_capacity),
            epoch: Instant::now(),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &ConflictMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn log(&self) -> &ConflictRingBuffer {
        &self.log
    }

    /// Nanoseconds since this observer was created, for event timestamps.
    #[must_use]
    pub fn elapsed_ns(&self) -> u64 {
        #[allow(clippy::cast_possible_truncation)] // clamped to u64::MAX
        {
            self.epoch.elapsed().as_nanos().min(u128::from(u64::MAX)) as u64
        }
    }

    pub fn reset(&self) {
        self.metrics.reset();
        self.log.clear();
    }
}

impl ConflictObserver for MetricsObserver {
    fn on_event(&self, event: &ConflictEvent) {
        self.metrics.record(event);
        self.log.push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_types::TableId;

    fn txn(n: u64) -> TxnId {
        TxnId::new(n).unwrap()
    }

    fn row(k: u64) -> LockResource {
        LockResource::Row(RowKey::new(TableId::new(1), k))
    }

    fn wait_event(key: u64, req: u64, hold: u64) -> ConflictEvent {
        ConflictEvent::LockWait {
            resource: row(key),
            requester: txn(req),
            mode: LockMode::Exclusive,
            blocker: Some(txn(hold)),
            timestamp_ns: 1000,
        }
    }

    fn waited_key(event: &ConflictEvent) -> Option<u64> {
        match event {
            ConflictEvent::LockWait {
                resource: LockResource::Row(r),
                ..
            } => Some(r.key),
            _ => None,
        }
    }

    #[test]
    fn noop_observer_accepts_events() {
        NoOpObserver.on_event(&wait_event(1, 2, 3));
    }

    #[test]
    fn ring_buffer_push_and_snapshot() {
        let rb = ConflictRingBuffer::new(3);
        assert!(rb.is_empty());
        rb.push(wait_event(1, 10, 20));
        rb.push(wait_event(2, 11, 21));
        assert_eq!(rb.len(), 2);
        let keys: Vec<_> = rb.snapshot().iter().filter_map(waited_key).collect();
        assert_eq!(keys, vec![1, 2]);
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let rb = ConflictRingBuffer::new(2);
        for k in 1..=5 {
            rb.push(wait_event(k, 10, 20));
        }
        assert_eq!(rb.len(), 2);
        let keys: Vec<_> = rb.snapshot().iter().filter_map(waited_key).collect();
        assert_eq!(keys, vec![4, 5]);
    }

    #[test]
    fn ring_buffer_clear_and_zero_capacity() {
        let rb = ConflictRingBuffer::new(4);
        rb.push(wait_event(1, 10, 20));
        rb.clear();
        assert!(rb.snapshot().is_empty());
        assert_eq!(rb.capacity(), 4);

        let empty = ConflictRingBuffer::new(0);
        empty.push(wait_event(1, 10, 20));
        assert!(empty.is_empty());
    }

    #[test]
    fn metrics_count_waits_and_hotspots() {
        let m = ConflictMetrics::new();
        m.record(&wait_event(1, 10, 20));
        m.record(&wait_event(1, 11, 20));
        m.record(&wait_event(2, 12, 20));

        assert_eq!(m.lock_waits.load(Ordering::Relaxed), 3);
        assert_eq!(m.conflicts_total.load(Ordering::Relaxed), 3);
        let hot = m.top_hotspots(5);
        assert_eq!(hot[0], (row(1), 2));
        assert_eq!(hot[1], (row(2), 1));
    }

    #[test]
    fn commits_are_not_conflicts() {
        let m = ConflictMetrics::new();
        m.record(&ConflictEvent::Committed {
            txn: txn(1),
            commit_ts: CommitTs::new(1),
            rows_written: 2,
            timestamp_ns: 5,
        });
        m.record(&ConflictEvent::DeadlockVictim {
            victim: txn(2),
            cycle: vec![txn(1), txn(2)],
            timestamp_ns: 6,
        });
        let snap = m.snapshot();
        assert_eq!(snap.commits, 1);
        assert_eq!(snap.deadlock_victims, 1);
        assert_eq!(snap.conflicts_total, 1);

        m.reset();
        assert_eq!(m.snapshot().commits, 0);
        assert!(m.top_hotspots(1).is_empty());
    }

    #[test]
    fn metrics_observer_records_both() {
        let obs = MetricsObserver::new(8);
        obs.on_event(&ConflictEvent::SsiAbort {
            txn: txn(3),
            reason: SsiAbortCategory::Pivot,
            in_edge_count: 1,
            out_edge_count: 1,
            timestamp_ns: obs.elapsed_ns(),
        });
        assert_eq!(obs.metrics().ssi_aborts.load(Ordering::Relaxed), 1);
        assert_eq!(obs.log().len(), 1);
        obs.reset();
        assert!(obs.log().is_empty());
    }

    #[test]
    fn events_serialize_to_json() {
        let json = serde_json::to_string(&wait_event(7, 1, 2)).unwrap();
        assert!(json.contains("LockWait"));
        assert!(json.contains("\"mode\":\"Exclusive\""));
        let snap = serde_json::to_string(&ConflictMetrics::new().snapshot()).unwrap();
        assert!(snap.contains("lock_timeouts"));
    }
}
