//! Wait-for graph construction and cycle detection.
//!
//! The graph is rebuilt from the lock manager's queues on every check, so it
//! can never disagree with them. A search that would visit more than
//! `max_graph_size` transactions gives up; the lock timeout then resolves
//! whatever cycle went unnoticed.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use concord_observability::ConflictEvent;
use concord_types::TxnId;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::lock_manager::LockManager;
use crate::observability::{EventSink, record_deadlock};

/// Directed graph: `a -> b` means `a` waits for a lock `b` holds or is
/// queued ahead for.
#[derive(Debug, Clone, Default)]
pub struct WaitForGraph {
    edges: BTreeMap<TxnId, SmallVec<[TxnId; 4]>>,
    /// Exclusive row locks held; the victim cost when the detector has no
    /// weight function of its own.
    weights: HashMap<TxnId, usize>,
}

impl WaitForGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&mut self, from: TxnId, to: TxnId) {
        let out = self.edges.entry(from).or_default();
        if !out.contains(&to) {
            out.push(to);
        }
        self.edges.entry(to).or_default();
    }

    pub fn set_weight(&mut self, txn: TxnId, weight: usize) {
        self.weights.insert(txn, weight);
    }

    #[must_use]
    pub fn weight(&self, txn: TxnId) -> usize {
        self.weights.get(&txn).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn successors(&self, txn: TxnId) -> &[TxnId] {
        self.edges.get(&txn).map_or(&[], |s| s.as_slice())
    }

    /// Every transaction with an edge, in id order.
    #[must_use]
    pub fn nodes(&self) -> Vec<TxnId> {
        self.edges.keys().copied().collect()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.values().map(SmallVec::len).sum()
    }

    /// Drop `txn` and every edge touching it.
    pub fn remove_node(&mut self, txn: TxnId) {
        self.edges.remove(&txn);
        for out in self.edges.values_mut() {
            out.retain(|t| *t != txn);
        }
        self.weights.remove(&txn);
    }

    /// Look for a cycle through `start`, visiting at most `max_nodes`
    /// transactions.
    #[must_use]
    pub fn find_cycle_from(&self, start: TxnId, max_nodes: usize) -> CycleSearch {
        if !self.edges.contains_key(&start) {
            return CycleSearch::None;
        }
        // Iterative DFS; each frame is (node, next successor to try).
        let mut visited: HashMap<TxnId, bool> = HashMap::new(); // node -> on stack
        let mut path: Vec<(TxnId, usize)> = vec![(start, 0)];
        visited.insert(start, true);

        while let Some(frame) = path.last_mut() {
            let node = frame.0;
            let Some(&child) = self.successors(node).get(frame.1) else {
                visited.insert(node, false);
                path.pop();
                continue;
            };
            frame.1 += 1;

            if child == start {
                return CycleSearch::Found(path.iter().map(|(t, _)| *t).collect());
            }
            match visited.get(&child) {
                // A cycle not through `start` belongs to another waiter's check.
                Some(_) => continue,
                None => {
                    if visited.len() >= max_nodes {
                        return CycleSearch::Truncated;
                    }
                    visited.insert(child, true);
                    path.push((child, 0));
                }
            }
        }
        CycleSearch::None
    }

    /// Any cycle at all, searched from each node in id order.
    #[must_use]
    pub fn find_any_cycle(&self, max_nodes: usize) -> Option<Vec<TxnId>> {
        self.edges
            .keys()
            .find_map(|&n| match self.find_cycle_from(n, max_nodes) {
                CycleSearch::Found(cycle) => Some(cycle),
                CycleSearch::None | CycleSearch::Truncated => None,
            })
    }
}

/// Outcome of [`WaitForGraph::find_cycle_from`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleSearch {
    /// Transactions on the cycle, starting with the search root.
    Found(Vec<TxnId>),
    None,
    /// The size bound was hit before the search finished.
    Truncated,
}

/// Victim choice: lowest weight, ties to the youngest (highest id)
/// transaction.
#[must_use]
pub fn select_victim(cycle: &[TxnId], weight: impl Fn(TxnId) -> usize) -> Option<TxnId> {
    cycle.iter().copied().min_by_key(|&t| (weight(t), Reverse(t)))
}

/// Cost of aborting a transaction. Called with every lock-manager shard
/// latched, so it must not take lock-manager locks itself.
pub type VictimWeight = Arc<dyn Fn(TxnId) -> usize + Send + Sync>;

/// Runs cycle detection against a [`LockManager`].
#[derive(Clone)]
pub struct DeadlockDetector {
    max_graph_size: usize,
    sink: EventSink,
    weight: Option<VictimWeight>,
}

impl DeadlockDetector {
    #[must_use]
    pub fn new(max_graph_size: usize, sink: EventSink) -> Self {
        Self {
            max_graph_size: max_graph_size.max(2),
            sink,
            weight: None,
        }
    }

    /// Weigh victims with `weight` instead of the exclusive row locks they
    /// hold.
    #[must_use]
    pub fn with_weight(mut self, weight: VictimWeight) -> Self {
        self.weight = Some(weight);
        self
    }

    fn weigh(&self, graph: &WaitForGraph, txn: TxnId) -> usize {
        match &self.weight {
            Some(weight) => weight(txn),
            None => graph.weight(txn),
        }
    }

    /// Check for a cycle through `requester` and, if one exists, fail the
    /// chosen victim's pending request. Returns the victim.
    pub fn check(&self, locks: &LockManager, requester: TxnId) -> Option<TxnId> {
        let mut table = locks.lock_all();
        let graph = table.wait_for_graph();
        let cycle = match graph.find_cycle_from(requester, self.max_graph_size) {
            CycleSearch::Found(cycle) => cycle,
            CycleSearch::None => return None,
            CycleSearch::Truncated => {
                debug!(
                    txn_id = %requester,
                    max_graph_size = self.max_graph_size,
                    "deadlock search truncated"
                );
                return None;
            }
        };
        let victim = select_victim(&cycle, |t| self.weigh(&graph, t))?;
        if !table.mark_victim(victim) {
            return None;
        }
        drop(table);
        self.report(victim, cycle);
        Some(victim)
    }

    /// Break every cycle currently in the graph. Returns the victims in the
    /// order they were chosen.
    pub fn sweep(&self, locks: &LockManager) -> Vec<TxnId> {
        let mut table = locks.lock_all();
        let mut graph = table.wait_for_graph();
        let mut victims = Vec::new();
        while let Some(cycle) = graph.find_any_cycle(self.max_graph_size) {
            let Some(victim) = select_victim(&cycle, |t| self.weigh(&graph, t)) else {
                break;
            };
            table.mark_victim(victim);
            graph.remove_node(victim);
            victims.push((victim, cycle));
        }
        drop(table);
        victims
            .into_iter()
            .map(|(victim, cycle)| {
                self.report(victim, cycle);
                victim
            })
            .collect()
    }

    fn report(&self, victim: TxnId, cycle: Vec<TxnId>) {
        record_deadlock();
        warn!(
            victim = %victim,
            cycle_len = cycle.len(),
            cycle = ?cycle,
            "deadlock detected; aborting victim"
        );
        self.sink.emit(|ts| ConflictEvent::DeadlockVictim {
            victim,
            cycle,
            timestamp_ns: ts,
        });
    }
}

impl std::fmt::Debug for DeadlockDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlockDetector")
            .field("max_graph_size", &self.max_graph_size)
            .field("custom_weight", &self.weight.is_some())
            .finish_non_exhaustive()
    }
}
