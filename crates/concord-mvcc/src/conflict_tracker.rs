//! Read/write footprints and commit-time SSI validation.
//!
//! Every transaction registers a footprint. Writes are recorded at every
//! isolation level; reads and range reads only under Serializable. At
//! commit a Serializable transaction looks for rw-antidependencies:
//!
//! - out-edge `T -> W`: W wrote something T read, and W is still active or
//!   committed after T's snapshot.
//! - in-edge `R -> T`: a Serializable R read something T writes, and R is
//!   still active or committed after T's snapshot.
//!
//! The caller serializes `validate` and `publish` under its commit latch.

use std::collections::{HashMap, HashSet};

use concord_error::{EngineError, Result, SerializationReason};
use concord_observability::{ConflictEvent, SsiAbortCategory};
use concord_types::{CommitTs, IsolationLevel, KeyRange, RowKey, TxnId};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::observability::{EventSink, record_ssi_abort};

/// Everything one transaction touched.
#[derive(Debug, Clone)]
pub struct Footprint {
    pub txn: TxnId,
    pub level: IsolationLevel,
    pub snapshot: CommitTs,
    pub reads: HashSet<RowKey>,
    /// Predicate reads from range scans.
    pub ranges: Vec<KeyRange>,
    pub writes: HashSet<RowKey>,
    pub has_in_rw: bool,
    pub has_out_rw: bool,
    pub marked_for_abort: bool,
    pub commit_ts: Option<CommitTs>,
}

impl Footprint {
    fn new(txn: TxnId, level: IsolationLevel, snapshot: CommitTs) -> Self {
        Self {
            txn,
            level,
            snapshot,
            reads: HashSet::new(),
            ranges: Vec::new(),
            writes: HashSet::new(),
            has_in_rw: false,
            has_out_rw: false,
            marked_for_abort: false,
            commit_ts: None,
        }
    }

    /// Whether a read of this footprint observed `row`'s old value.
    fn read_covers(&self, row: RowKey) -> bool {
        self.reads.contains(&row) || self.ranges.iter().any(|r| r.contains(row))
    }

    /// Row of `writes` that some read of `reader` covers, if any.
    fn overlap_with_reads_of(&self, reader: &Self) -> Option<RowKey> {
        let mut hits: Vec<RowKey> = self
            .writes
            .iter()
            .copied()
            .filter(|w| reader.read_covers(*w))
            .collect();
        hits.sort_unstable();
        hits.first().copied()
    }

    /// Concurrent with a transaction whose snapshot is `snapshot`.
    fn concurrent_with(&self, snapshot: CommitTs) -> bool {
        self.commit_ts.is_none_or(|c| c > snapshot)
    }
}

/// An rw-antidependency found during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredEdge {
    /// Reader.
    pub from: TxnId,
    /// Writer that overwrote what `from` read.
    pub to: TxnId,
    pub key: RowKey,
    /// The peer end of the edge had already committed.
    pub peer_committed: bool,
    /// The peer's `has_in_rw` at discovery time.
    pub peer_has_in_rw: bool,
}

/// Edges discovered for one committing transaction.
#[derive(Debug, Clone, Default)]
pub struct Validation {
    pub in_edges: Vec<DiscoveredEdge>,
    pub out_edges: Vec<DiscoveredEdge>,
}

impl Validation {
    /// An in-edge and an out-edge through two different peers. A two-cycle
    /// with a single active peer is left to that peer, which `publish`
    /// marks for abort.
    #[must_use]
    pub fn is_pivot(&self) -> bool {
        self.in_edges
            .iter()
            .any(|i| self.out_edges.iter().any(|o| o.to != i.from))
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    active: HashMap<TxnId, Footprint>,
    /// Footprints of committed transactions still concurrent with some
    /// active snapshot.
    committed: Vec<Footprint>,
}

/// Footprint registry and SSI validator.
#[derive(Debug)]
pub struct ConflictTracker {
    state: Mutex<TrackerState>,
    sink: EventSink,
}

impl ConflictTracker {
    #[must_use]
    pub fn new(sink: EventSink) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            sink,
        }
    }

    pub fn register(&self, txn: TxnId, level: IsolationLevel, snapshot: CommitTs) {
        self.state
            .lock()
            .active
            .insert(txn, Footprint::new(txn, level, snapshot));
    }

    /// Record a snapshot read of `row`. No-op below Serializable.
    pub fn record_read(&self, txn: TxnId, row: RowKey) {
        let mut state = self.state.lock();
        if let Some(fp) = state.active.get_mut(&txn) {
            if fp.level.tracks_reads() {
                fp.reads.insert(row);
            }
        }
    }

    /// Record a predicate read over `range`. No-op below Serializable.
    pub fn record_range(&self, txn: TxnId, range: KeyRange) {
        if range.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        if let Some(fp) = state.active.get_mut(&txn) {
            if fp.level.tracks_reads() && !fp.ranges.iter().any(|r| *r == range) {
                fp.ranges.push(range);
            }
        }
    }

    pub fn record_write(&self, txn: TxnId, row: RowKey) {
        if let Some(fp) = self.state.lock().active.get_mut(&txn) {
            fp.writes.insert(row);
        }
    }

    /// Whether a committer found `txn` to be a pivot and marked it.
    #[must_use]
    pub fn is_marked(&self, txn: TxnId) -> bool {
        self.state
            .lock()
            .active
            .get(&txn)
            .is_some_and(|fp| fp.marked_for_abort)
    }

    /// Copy of `txn`'s footprint while it is active.
    #[must_use]
    pub fn footprint(&self, txn: TxnId) -> Option<Footprint> {
        self.state.lock().active.get(&txn).cloned()
    }

    /// Forget an aborted transaction.
    pub fn remove(&self, txn: TxnId) {
        self.state.lock().active.remove(&txn);
    }

    /// Drop committed footprints no active snapshot can be concurrent with.
    /// Returns how many were dropped.
    pub fn prune(&self, watermark: CommitTs) -> usize {
        let mut state = self.state.lock();
        let before = state.committed.len();
        state
            .committed
            .retain(|fp| fp.commit_ts.is_some_and(|c| c > watermark));
        before - state.committed.len()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    #[must_use]
    pub fn retained_count(&self) -> usize {
        self.state.lock().committed.len()
    }

    fn discover(state: &TrackerState, me: &Footprint) -> Validation {
        let mut validation = Validation::default();
        let peers = state
            .active
            .values()
            .filter(|p| p.txn != me.txn)
            .chain(state.committed.iter())
            .filter(|p| p.concurrent_with(me.snapshot));

        for peer in peers {
            let peer_committed = peer.commit_ts.is_some();
            if let Some(key) = peer.overlap_with_reads_of(me) {
                debug!(from = %me.txn, to = %peer.txn, %key, peer_committed, "out rw-antidependency");
                validation.out_edges.push(DiscoveredEdge {
                    from: me.txn,
                    to: peer.txn,
                    key,
                    peer_committed,
                    peer_has_in_rw: peer.has_in_rw,
                });
            }
            if peer.level.tracks_reads() {
                if let Some(key) = me.overlap_with_reads_of(peer) {
                    debug!(from = %peer.txn, to = %me.txn, %key, peer_committed, "in rw-antidependency");
                    validation.in_edges.push(DiscoveredEdge {
                        from: peer.txn,
                        to: me.txn,
                        key,
                        peer_committed,
                        peer_has_in_rw: peer.has_in_rw,
                    });
                }
            }
        }
        validation.in_edges.sort_by_key(|e| e.from);
        validation.out_edges.sort_by_key(|e| e.to);
        validation
    }

    /// Decide whether `txn` may commit at `commit_ts`.
    ///
    /// Non-Serializable transactions always pass. Abort rules, in order:
    /// marked for abort, out-edge to an already committed writer (stale
    /// read), in-edge from a committed reader that itself had an in-edge
    /// (committed pivot), an in-edge and an out-edge through distinct peers
    /// (pivot).
    pub fn validate(&self, txn: TxnId, commit_ts: CommitTs) -> Result<Validation> {
        let state = self.state.lock();
        let me = state
            .active
            .get(&txn)
            .ok_or(EngineError::UnknownTransaction { txn })?;
        if me.level != IsolationLevel::Serializable {
            return Ok(Validation::default());
        }

        let span = tracing::info_span!(
            "ssi_validate",
            txn_id = txn.get(),
            %commit_ts,
            read_set_size = me.reads.len(),
            range_count = me.ranges.len(),
            write_set_size = me.writes.len(),
            conflict_detected = tracing::field::Empty,
            decision_reason = tracing::field::Empty,
        );
        let _guard = span.enter();

        let (validation, reason) = if me.marked_for_abort {
            (Validation::default(), Some(SerializationReason::MarkedForAbort))
        } else {
            let validation = Self::discover(&state, me);
            let reason = if validation.out_edges.iter().any(|e| e.peer_committed) {
                Some(SerializationReason::StaleRead)
            } else if validation
                .in_edges
                .iter()
                .any(|e| e.peer_committed && e.peer_has_in_rw)
            {
                Some(SerializationReason::CommittedPivot)
            } else if validation.is_pivot() {
                Some(SerializationReason::Pivot)
            } else {
                None
            };
            (validation, reason)
        };
        drop(state);

        let Some(reason) = reason else {
            span.record("conflict_detected", false);
            span.record("decision_reason", "commit_approved");
            info!(
                txn_id = %txn,
                incoming = validation.in_edges.len(),
                outgoing = validation.out_edges.len(),
                "ssi validation passed"
            );
            return Ok(validation);
        };

        span.record("conflict_detected", true);
        span.record("decision_reason", reason.as_str());
        record_ssi_abort();
        warn!(
            txn_id = %txn,
            %reason,
            incoming = validation.in_edges.len(),
            outgoing = validation.out_edges.len(),
            "ssi validation failed"
        );
        self.sink.emit(|ts| ConflictEvent::SsiAbort {
            txn,
            reason: match reason {
                SerializationReason::Pivot => SsiAbortCategory::Pivot,
                SerializationReason::StaleRead => SsiAbortCategory::StaleRead,
                SerializationReason::CommittedPivot => SsiAbortCategory::CommittedPivot,
                SerializationReason::MarkedForAbort => SsiAbortCategory::MarkedForAbort,
            },
            in_edge_count: validation.in_edges.len(),
            out_edge_count: validation.out_edges.len(),
            timestamp_ns: ts,
        });
        Err(EngineError::SerializationFailure { txn, reason })
    }

    /// Record `txn` as committed at `commit_ts`, propagating `validation`'s
    /// edges to active peers. A peer that ends up with both an in-edge and
    /// an out-edge is marked for abort.
    pub fn publish(&self, txn: TxnId, commit_ts: CommitTs, validation: &Validation) {
        let mut state = self.state.lock();
        let Some(mut me) = state.active.remove(&txn) else {
            return;
        };
        me.commit_ts = Some(commit_ts);
        me.has_in_rw |= !validation.in_edges.is_empty();
        me.has_out_rw |= !validation.out_edges.is_empty();

        for edge in validation.in_edges.iter().filter(|e| !e.peer_committed) {
            if let Some(reader) = state.active.get_mut(&edge.from) {
                reader.has_out_rw = true;
                if reader.has_in_rw && !reader.marked_for_abort {
                    reader.marked_for_abort = true;
                    debug!(pivot = %reader.txn, committer = %txn, "active reader became pivot; marked for abort");
                }
            }
        }
        for edge in validation.out_edges.iter().filter(|e| !e.peer_committed) {
            if let Some(writer) = state.active.get_mut(&edge.to) {
                writer.has_in_rw = true;
                if writer.has_out_rw && !writer.marked_for_abort {
                    writer.marked_for_abort = true;
                    debug!(pivot = %writer.txn, committer = %txn, "active writer became pivot; marked for abort");
                }
            }
        }

        // Other transactions only ever look at committed writes, and at
        // committed Serializable reads for the committed-pivot rule.
        let keep = !me.writes.is_empty()
            || (me.level.tracks_reads() && (!me.reads.is_empty() || !me.ranges.is_empty()));
        if keep {
            state.committed.push(me);
        }
    }
}
