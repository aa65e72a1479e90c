//! Engine-wide counters and the event sink shared by the components.
//!
//! Nothing here blocks: counters are relaxed atomics and observers are
//! required to be non-blocking.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use concord_observability::{ConflictEvent, ConflictObserver};
use serde::Serialize;

/// Optional observer handle. When `None`, no callback overhead.
pub type SharedObserver = Option<Arc<dyn ConflictObserver>>;

/// Stamps events with a monotonic timestamp and forwards them to the
/// configured observer.
#[derive(Clone)]
pub struct EventSink {
    observer: SharedObserver,
    epoch: Instant,
}

impl EventSink {
    #[must_use]
    pub fn new(observer: SharedObserver) -> Self {
        Self {
            observer,
            epoch: Instant::now(),
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Build and deliver an event. `make` only runs when an observer is
    /// installed.
    #[inline]
    pub fn emit(&self, make: impl FnOnce(u64) -> ConflictEvent) {
        if let Some(obs) = &self.observer {
            #[allow(clippy::cast_possible_truncation)] // clamped to u64::MAX
            let ts = self.epoch.elapsed().as_nanos().min(u128::from(u64::MAX)) as u64;
            obs.on_event(&make(ts));
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Process-wide counters
// ---------------------------------------------------------------------------

/// Histogram of versions walked per snapshot read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct VersionsTraversedHistogram {
    pub le_1: u64,
    pub le_2: u64,
    pub le_4: u64,
    pub le_8: u64,
    pub le_16: u64,
    pub gt_16: u64,
}

/// Snapshot of the process-wide engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EngineMetricsSnapshot {
    pub versions_traversed: VersionsTraversedHistogram,
    pub snapshot_reads: u64,
    pub versions_traversed_sum: u64,
    pub lock_waits: u64,
    pub lock_timeouts: u64,
    pub deadlocks_detected: u64,
    pub ssi_aborts: u64,
    pub gc_versions_reclaimed: u64,
}

static TRAVERSED_LE_1: AtomicU64 = AtomicU64::new(0);
static TRAVERSED_LE_2: AtomicU64 = AtomicU64::new(0);
static TRAVERSED_LE_4: AtomicU64 = AtomicU64::new(0);
static TRAVERSED_LE_8: AtomicU64 = AtomicU64::new(0);
static TRAVERSED_LE_16: AtomicU64 = AtomicU64::new(0);
static TRAVERSED_GT_16: AtomicU64 = AtomicU64::new(0);
static SNAPSHOT_READS: AtomicU64 = AtomicU64::new(0);
static TRAVERSED_SUM: AtomicU64 = AtomicU64::new(0);
static LOCK_WAITS: AtomicU64 = AtomicU64::new(0);
static LOCK_TIMEOUTS: AtomicU64 = AtomicU64::new(0);
static DEADLOCKS_DETECTED: AtomicU64 = AtomicU64::new(0);
static SSI_ABORTS: AtomicU64 = AtomicU64::new(0);
static GC_RECLAIMED: AtomicU64 = AtomicU64::new(0);

pub fn record_versions_traversed(n: u64) {
    SNAPSHOT_READS.fetch_add(1, Ordering::Relaxed);
    TRAVERSED_SUM.fetch_add(n, Ordering::Relaxed);
    let bucket = match n {
        0..=1 => &TRAVERSED_LE_1,
        2 => &TRAVERSED_LE_2,
        3..=4 => &TRAVERSED_LE_4,
        5..=8 => &TRAVERSED_LE_8,
        9..=16 => &TRAVERSED_LE_16,
        _ => &TRAVERSED_GT_16,
    };
    bucket.fetch_add(1, Ordering::Relaxed);
}

pub fn record_lock_wait() {
    LOCK_WAITS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_lock_timeout() {
    LOCK_TIMEOUTS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_deadlock() {
    DEADLOCKS_DETECTED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_ssi_abort() {
    SSI_ABORTS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_gc_reclaimed(n: u64) {
    GC_RECLAIMED.fetch_add(n, Ordering::Relaxed);
}

#[must_use]
pub fn engine_metrics_snapshot() -> EngineMetricsSnapshot {
    EngineMetricsSnapshot {
        versions_traversed: VersionsTraversedHistogram {
            le_1: TRAVERSED_LE_1.load(Ordering::Relaxed),
            le_2: TRAVERSED_LE_2.load(Ordering::Relaxed),
            le_4: TRAVERSED_LE_4.load(Ordering::Relaxed),
            le_8: TRAVERSED_LE_8.load(Ordering::Relaxed),
            le_16: TRAVERSED_LE_16.load(Ordering::Relaxed),
            gt_16: TRAVERSED_GT_16.load(Ordering::Relaxed),
        },
        snapshot_reads: SNAPSHOT_READS.load(Ordering::Relaxed),
        versions_traversed_sum: TRAVERSED_SUM.load(Ordering::Relaxed),
        lock_waits: LOCK_WAITS.load(Ordering::Relaxed),
        lock_timeouts: LOCK_TIMEOUTS.load(Ordering::Relaxed),
        deadlocks_detected: DEADLOCKS_DETECTED.load(Ordering::Relaxed),
        ssi_aborts: SSI_ABORTS.load(Ordering::Relaxed),
        gc_versions_reclaimed: GC_RECLAIMED.load(Ordering::Relaxed),
    }
}

/// Reset every process-wide counter. Intended for tests and benchmarks.
pub fn reset_engine_metrics() {
    for counter in [
        &TRAVERSED_LE_1,
        &TRAVERSED_LE_2,
        &TRAVERSED_LE_4,
        &TRAVERSED_LE_8,
        &TRAVERSED_LE_16,
        &TRAVERSED_GT_16,
        &SNAPSHOT_READS,
        &TRAVERSED_SUM,
        &LOCK_WAITS,
        &LOCK_TIMEOUTS,
        &DEADLOCKS_DETECTED,
        &SSI_ABORTS,
        &GC_RECLAIMED,
    ] {
        counter.store(0, Ordering::Relaxed);
    }
}
