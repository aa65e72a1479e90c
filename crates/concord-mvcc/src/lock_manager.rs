//! Hierarchical lock manager.
//!
//! Locks are strict two-phase: taken one at a time as a transaction touches
//! resources and released together by [`LockManager::release_all`]. Each
//! resource has a granted set and a FIFO wait queue; upgrades queue ahead of
//! fresh requests. The manager only blocks and wakes callers. Cycle
//! detection lives in [`crate::deadlock`], which inspects the queues here
//! through [`LockManager::lock_all`].
//!
//! Latch order: shard latches in index order, then the owner table, then the
//! victim set. The acquire path never holds two shard latches at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use concord_observability::ConflictEvent;
use concord_types::{LockMode, LockResource, TxnId};
use parking_lot::{Condvar, Mutex, MutexGuard};
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::deadlock::{DeadlockDetector, WaitForGraph};
use crate::observability::{EventSink, record_lock_timeout, record_lock_wait};

/// Number of latch shards for the lock table.
pub const LOCK_SHARDS: usize = 64;

/// Result of [`LockManager::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    TimedOut,
    /// The deadlock detector chose this transaction as a victim.
    Aborted,
    /// [`LockManager::release_all`] ran for this transaction while it
    /// waited.
    Cancelled,
}

// ---------------------------------------------------------------------------
// Per-resource queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestStatus {
    Waiting,
    Victim,
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
struct Grant {
    txn: TxnId,
    mode: LockMode,
}

#[derive(Debug, Clone, Copy)]
struct LockRequest {
    txn: TxnId,
    /// Mode the transaction will hold once granted (already combined with
    /// any mode it holds).
    mode: LockMode,
    upgrade: bool,
    status: RequestStatus,
}

#[derive(Debug, Default)]
pub(crate) struct ResourceQueue {
    granted: SmallVec<[Grant; 4]>,
    waiting: VecDeque<LockRequest>,
}

impl ResourceQueue {
    fn held_by(&self, txn: TxnId) -> Option<LockMode> {
        self.granted.iter().find(|g| g.txn == txn).map(|g| g.mode)
    }

    fn compatible_with_others(&self, txn: TxnId, mode: LockMode) -> bool {
        self.granted
            .iter()
            .filter(|g| g.txn != txn)
            .all(|g| g.mode.compatible(mode))
    }

    fn first_blocker(&self, txn: TxnId, mode: LockMode) -> Option<TxnId> {
        self.granted
            .iter()
            .find(|g| g.txn != txn && !g.mode.compatible(mode))
            .map(|g| g.txn)
    }

    fn has_live_waiters(&self) -> bool {
        self.waiting
            .iter()
            .any(|w| w.status == RequestStatus::Waiting)
    }

    fn grant(&mut self, txn: TxnId, mode: LockMode) {
        if let Some(g) = self.granted.iter_mut().find(|g| g.txn == txn) {
            g.mode = g.mode.supremum(mode);
        } else {
            self.granted.push(Grant { txn, mode });
        }
    }

    /// Grant waiting requests front to back until the first one that must
    /// keep waiting. Victims and cancelled requests are skipped; they leave
    /// on their own.
    fn promote(&mut self) -> usize {
        let mut promoted = 0;
        let mut i = 0;
        while i < self.waiting.len() {
            let req = self.waiting[i];
            if req.status != RequestStatus::Waiting {
                i += 1;
                continue;
            }
            if !self.compatible_with_others(req.txn, req.mode) {
                break;
            }
            self.waiting.remove(i);
            self.grant(req.txn, req.mode);
            promoted += 1;
        }
        promoted
    }

    fn is_empty(&self) -> bool {
        self.granted.is_empty() && self.waiting.is_empty()
    }

    /// Wait-for edges contributed by this queue.
    ///
    /// A waiter waits for every incompatible holder. A plain request also
    /// waits for every live request queued ahead of it, because grants are
    /// strictly FIFO. Upgrades only wait for holders.
    fn wait_edges(&self, mut edge: impl FnMut(TxnId, TxnId)) {
        for (pos, req) in self.waiting.iter().enumerate() {
            if req.status != RequestStatus::Waiting {
                continue;
            }
            for g in &self.granted {
                if g.txn != req.txn && !g.mode.compatible(req.mode) {
                    edge(req.txn, g.txn);
                }
            }
            if req.upgrade {
                continue;
            }
            for ahead in self.waiting.iter().take(pos) {
                if ahead.status == RequestStatus::Waiting && ahead.txn != req.txn {
                    edge(req.txn, ahead.txn);
                }
            }
        }
    }
}

struct LockShard {
    queues: Mutex<HashMap<LockResource, ResourceQueue>>,
    cv: Condvar,
}

/// Locks one transaction holds, and the request it is blocked on.
#[derive(Debug, Default)]
struct OwnedLocks {
    held: HashMap<LockResource, LockMode>,
    /// Exclusive row locks: one per row written.
    exclusive_rows: usize,
    /// A transaction waits on at most one request at a time.
    waiting: Option<LockResource>,
}

// ---------------------------------------------------------------------------
// LockManager
// ---------------------------------------------------------------------------

/// Row/gap/table lock manager with FIFO wait queues.
pub struct LockManager {
    shards: Box<[LockShard; LOCK_SHARDS]>,
    owners: Mutex<HashMap<TxnId, OwnedLocks>>,
    victims: Mutex<HashSet<TxnId>>,
    /// Bumped on every enqueue, grant, timeout and release. Waiters rerun
    /// cycle detection when it moves.
    epoch: AtomicU64,
    detector: Option<DeadlockDetector>,
    recheck: Duration,
    sink: EventSink,
}

impl LockManager {
    /// Lock manager without deadlock detection.
    #[must_use]
    pub fn new() -> Self {
        Self::with_detector(None, Duration::from_millis(25), EventSink::disabled())
    }

    /// Lock manager that runs `detector` whenever a request has to wait and,
    /// while it keeps waiting, every `recheck` interval in which lock state
    /// changed.
    #[must_use]
    pub fn with_detector(
        detector: Option<DeadlockDetector>,
        recheck: Duration,
        sink: EventSink,
    ) -> Self {
        Self {
            shards: Box::new(std::array::from_fn(|_| LockShard {
                queues: Mutex::new(HashMap::new()),
                cv: Condvar::new(),
            })),
            owners: Mutex::new(HashMap::new()),
            victims: Mutex::new(HashSet::new()),
            epoch: AtomicU64::new(0),
            detector,
            recheck,
            sink,
        }
    }

    #[inline]
    fn shard_index(resource: &LockResource) -> usize {
        let (tag, table, key) = match resource {
            LockResource::Table(t) => (1_u64, t.get(), 0),
            LockResource::Gap(g) => (2, g.table.get(), g.upper.unwrap_or(u64::MAX)),
            LockResource::Row(r) => (3, r.table.get(), r.key),
        };
        let mixed = key ^ (u64::from(table) << 40) ^ (tag << 60);
        #[allow(clippy::cast_possible_truncation)] // top 6 bits only
        let idx = (mixed.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 58) as usize;
        idx % LOCK_SHARDS
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Acquire `mode` on `resource`, taking the matching intention lock on
    /// its parent first. Blocks until granted, `timeout` elapses, or the
    /// transaction is chosen as a deadlock victim.
    pub fn acquire(
        &self,
        txn: TxnId,
        resource: LockResource,
        mode: LockMode,
        timeout: Duration,
    ) -> LockOutcome {
        let deadline = Instant::now() + timeout;
        if let Some(parent) = resource.parent() {
            let outcome = self.acquire_one(txn, parent, mode.parent_intention(), deadline);
            if outcome != LockOutcome::Granted {
                return outcome;
            }
        }
        self.acquire_one(txn, resource, mode, deadline)
    }

    fn acquire_one(
        &self,
        txn: TxnId,
        resource: LockResource,
        mode: LockMode,
        deadline: Instant,
    ) -> LockOutcome {
        let held = self.held_mode(txn, resource);
        if held.is_some_and(|h| h.covers(mode)) {
            return LockOutcome::Granted;
        }
        let target = held.map_or(mode, |h| h.supremum(mode));
        let upgrade = held.is_some();

        let shard = &self.shards[Self::shard_index(&resource)];
        let mut queues = shard.queues.lock();
        let queue = queues.entry(resource).or_default();
        if (upgrade || !queue.has_live_waiters()) && queue.compatible_with_others(txn, target) {
            queue.grant(txn, target);
            drop(queues);
            self.note_granted(txn, resource, target);
            debug!(txn_id = %txn, %resource, %target, "lock granted");
            return LockOutcome::Granted;
        }

        let blocker = queue.first_blocker(txn, target);
        let request = LockRequest {
            txn,
            mode: target,
            upgrade,
            status: RequestStatus::Waiting,
        };
        if upgrade {
            queue.waiting.push_front(request);
        } else {
            queue.waiting.push_back(request);
        }
        self.owners.lock().entry(txn).or_default().waiting = Some(resource);
        drop(queues);
        self.bump_epoch();

        record_lock_wait();
        debug!(
            txn_id = %txn,
            %resource,
            %target,
            upgrade,
            blocker = ?blocker,
            "lock request queued"
        );
        self.sink.emit(|ts| ConflictEvent::LockWait {
            resource,
            requester: txn,
            mode: target,
            blocker,
            timestamp_ns: ts,
        });

        let outcome = self.wait(txn, resource, target, deadline);
        self.clear_waiting(txn);
        outcome
    }

    fn clear_waiting(&self, txn: TxnId) {
        let mut owners = self.owners.lock();
        if let Some(owned) = owners.get_mut(&txn) {
            owned.waiting = None;
            if owned.held.is_empty() {
                owners.remove(&txn);
            }
        }
    }

    fn wait(
        &self,
        txn: TxnId,
        resource: LockResource,
        target: LockMode,
        deadline: Instant,
    ) -> LockOutcome {
        let started = Instant::now();
        let shard = &self.shards[Self::shard_index(&resource)];
        let mut checked_epoch = None;

        loop {
            if let Some(detector) = &self.detector {
                let epoch = self.epoch.load(Ordering::Acquire);
                if checked_epoch != Some(epoch) {
                    checked_epoch = Some(epoch);
                    detector.check(self, txn);
                }
            }

            let mut queues = shard.queues.lock();
            let Some(queue) = queues.get_mut(&resource) else {
                debug!(txn_id = %txn, %resource, "lock queue dropped while waiting");
                return LockOutcome::Cancelled;
            };

            let Some(pos) = queue.waiting.iter().position(|w| w.txn == txn) else {
                if queue.held_by(txn).is_some_and(|m| m.covers(target)) {
                    drop(queues);
                    self.note_granted(txn, resource, target);
                    debug!(
                        txn_id = %txn,
                        %resource,
                        %target,
                        waited_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
                        "lock granted after wait"
                    );
                    return LockOutcome::Granted;
                }
                // Granted and then taken back by release_all.
                debug!(txn_id = %txn, %resource, "lock released while waiting");
                return LockOutcome::Cancelled;
            };

            if queue.waiting[pos].status == RequestStatus::Cancelled {
                queue.waiting.remove(pos);
                if queue.is_empty() {
                    queues.remove(&resource);
                }
                debug!(txn_id = %txn, %resource, "lock wait cancelled");
                return LockOutcome::Cancelled;
            }

            if queue.waiting[pos].status == RequestStatus::Victim {
                queue.waiting.remove(pos);
                queue.promote();
                if queue.is_empty() {
                    queues.remove(&resource);
                }
                shard.cv.notify_all();
                drop(queues);
                self.bump_epoch();
                debug!(txn_id = %txn, %resource, "lock wait aborted: deadlock victim");
                return LockOutcome::Aborted;
            }

            let now = Instant::now();
            if now >= deadline {
                queue.waiting.remove(pos);
                if queue.promote() > 0 {
                    shard.cv.notify_all();
                }
                if queue.is_empty() {
                    queues.remove(&resource);
                }
                drop(queues);
                self.bump_epoch();

                let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                record_lock_timeout();
                warn!(txn_id = %txn, %resource, %target, waited_ms, "lock wait timed out");
                self.sink.emit(|ts| ConflictEvent::LockTimeout {
                    resource,
                    txn,
                    waited_ms,
                    timestamp_ns: ts,
                });
                return LockOutcome::TimedOut;
            }

            let slice = (deadline - now).min(self.recheck);
            shard.cv.wait_for(&mut queues, slice);
        }
    }

    fn note_granted(&self, txn: TxnId, resource: LockResource, mode: LockMode) {
        {
            let mut owners = self.owners.lock();
            let owned = owners.entry(txn).or_default();
            let previous = owned.held.insert(resource, mode);
            if matches!(resource, LockResource::Row(_))
                && mode == LockMode::Exclusive
                && previous != Some(LockMode::Exclusive)
            {
                owned.exclusive_rows += 1;
            }
        }
        self.bump_epoch();
    }

    /// Release every lock `txn` holds and wake the waiters they unblock.
    /// A request `txn` is still blocked on fails with
    /// [`LockOutcome::Cancelled`]. Returns the number of locks released.
    pub fn release_all(&self, txn: TxnId) -> usize {
        let owned = self.owners.lock().remove(&txn);
        self.victims.lock().remove(&txn);
        let Some(owned) = owned else {
            return 0;
        };

        if let Some(resource) = owned.waiting {
            let shard = &self.shards[Self::shard_index(&resource)];
            let mut queues = shard.queues.lock();
            if let Some(queue) = queues.get_mut(&resource) {
                // A grant promoted before the waiter woke is taken back too.
                queue.granted.retain(|g| g.txn != txn);
                for req in queue.waiting.iter_mut().filter(|r| r.txn == txn) {
                    req.status = RequestStatus::Cancelled;
                }
                queue.promote();
                if queue.is_empty() {
                    queues.remove(&resource);
                }
            }
            shard.cv.notify_all();
        }

        let released = owned.held.len();
        for resource in owned.held.keys() {
            let shard = &self.shards[Self::shard_index(resource)];
            let mut queues = shard.queues.lock();
            if let Some(queue) = queues.get_mut(resource) {
                queue.granted.retain(|g| g.txn != txn);
                queue.waiting.retain(|w| w.txn != txn);
                queue.promote();
                if queue.is_empty() {
                    queues.remove(resource);
                }
            }
            shard.cv.notify_all();
        }
        self.bump_epoch();
        debug!(txn_id = %txn, released, "locks released");
        released
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Mode `txn` holds on `resource`, if any.
    #[must_use]
    pub fn held_mode(&self, txn: TxnId, resource: LockResource) -> Option<LockMode> {
        self.owners.lock().get(&txn)?.held.get(&resource).copied()
    }

    /// Current holders of `resource`.
    #[must_use]
    pub fn holders(&self, resource: LockResource) -> Vec<(TxnId, LockMode)> {
        let shard = &self.shards[Self::shard_index(&resource)];
        shard
            .queues
            .lock()
            .get(&resource)
            .map(|q| q.granted.iter().map(|g| (g.txn, g.mode)).collect())
            .unwrap_or_default()
    }

    /// Whether anyone holds or waits for `resource`.
    #[must_use]
    pub fn is_referenced(&self, resource: LockResource) -> bool {
        let shard = &self.shards[Self::shard_index(&resource)];
        shard.queues.lock().contains_key(&resource)
    }

    /// Number of exclusive row locks `txn` holds.
    #[must_use]
    pub fn exclusive_rows(&self, txn: TxnId) -> usize {
        self.owners.lock().get(&txn).map_or(0, |o| o.exclusive_rows)
    }

    /// Total granted locks across all transactions.
    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.owners.lock().values().map(|o| o.held.len()).sum()
    }

    /// Number of requests currently queued.
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.queues.lock().values().map(|q| q.waiting.len()).sum::<usize>())
            .sum()
    }

    /// Whether `txn` has been chosen as a deadlock victim and not yet
    /// released its locks.
    #[must_use]
    pub fn is_victim(&self, txn: TxnId) -> bool {
        self.victims.lock().contains(&txn)
    }

    /// Current wait-for graph.
    #[must_use]
    pub fn wait_for_graph(&self) -> WaitForGraph {
        self.lock_all().wait_for_graph()
    }

    /// Latch every shard (in index order) for a consistent view of all
    /// queues.
    pub(crate) fn lock_all(&self) -> LockTableGuard<'_> {
        LockTableGuard {
            manager: self,
            shards: self.shards.iter().map(|s| s.queues.lock()).collect(),
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("locks", &self.lock_count())
            .field("detection", &self.detector.is_some())
            .finish_non_exhaustive()
    }
}

/// Every shard of a [`LockManager`] latched at once.
pub(crate) struct LockTableGuard<'a> {
    manager: &'a LockManager,
    shards: Vec<MutexGuard<'a, HashMap<LockResource, ResourceQueue>>>,
}

impl LockTableGuard<'_> {
    /// Wait-for graph with each node weighted by its exclusive row locks.
    pub(crate) fn wait_for_graph(&self) -> WaitForGraph {
        let mut graph = WaitForGraph::new();
        for shard in &self.shards {
            for queue in shard.values() {
                queue.wait_edges(|from, to| graph.add_edge(from, to));
            }
        }
        let owners = self.manager.owners.lock();
        for txn in graph.nodes() {
            let weight = owners.get(&txn).map_or(0, |o| o.exclusive_rows);
            graph.set_weight(txn, weight);
        }
        graph
    }

    /// Fail `txn`'s queued request and wake it. Returns `false` if the
    /// transaction was not waiting.
    pub(crate) fn mark_victim(&mut self, txn: TxnId) -> bool {
        let mut marked = false;
        for (idx, shard) in self.shards.iter_mut().enumerate() {
            let mut touched = false;
            for queue in shard.values_mut() {
                let mut hit = false;
                for req in queue.waiting.iter_mut().filter(|r| r.txn == txn) {
                    req.status = RequestStatus::Victim;
                    hit = true;
                }
                if hit {
                    queue.promote();
                    touched = true;
                }
            }
            if touched {
                self.manager.shards[idx].cv.notify_all();
                marked = true;
            }
        }
        if marked {
            self.manager.victims.lock().insert(txn);
            self.manager.bump_epoch();
        }
        marked
    }
}
