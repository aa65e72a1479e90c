//! Multi-version row store.
//!
//! Each row owns a newest-first chain of [`Version`]s living in a per-shard
//! [`VersionArena`]. The store enforces only the data-structure rules
//! (one pending writer per row, visibility by snapshot); callers are
//! expected to hold the row's exclusive lock before writing.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Bound;

use concord_error::{EngineError, Result};
use concord_types::{CommitTs, KeyRange, Payload, RowKey, TableId, TxnId};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, trace};

use crate::core_types::{Version, VersionArena, VersionHandle, VersionIdx, visible};
use crate::observability::{record_gc_reclaimed, record_versions_traversed};

/// Number of independently latched store shards.
pub const VERSION_STORE_SHARDS: usize = 64;

/// Snapshot that sees every committed version.
pub const LATEST: CommitTs = CommitTs::new(u64::MAX);

#[derive(Debug, Default)]
struct VersionShard {
    arena: VersionArena,
    heads: HashMap<RowKey, VersionIdx>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ChainPrune {
    reclaimed: usize,
    /// The newest version was deleted at or before the watermark.
    dead_head: bool,
}

impl VersionShard {
    fn resolve(
        &self,
        row: RowKey,
        snapshot: CommitTs,
        reader: Option<TxnId>,
    ) -> (Option<Payload>, u64) {
        let Some(&head_idx) = self.heads.get(&row) else {
            return (None, 0);
        };

        // A transaction's own effects sit at the head and override its snapshot.
        if let (Some(me), Some(head)) = (reader, self.arena.get(head_idx)) {
            if head.is_pending() && head.created_by == me {
                return (Some(head.payload.clone()), 1);
            }
            if head.pending_delete() == Some(me) {
                return (None, 1);
            }
        }

        let mut traversed = 0;
        let mut cursor = Some(head_idx);
        while let Some(idx) = cursor {
            let Some(version) = self.arena.get(idx) else {
                break;
            };
            traversed += 1;
            // Older versions were all created before this one.
            if version.created_at.is_some_and(|c| c <= snapshot) {
                return (
                    visible(version, snapshot).then(|| version.payload.clone()),
                    traversed,
                );
            }
            cursor = version.prev;
        }
        (None, traversed)
    }

    fn prune_chain(&mut self, head: VersionIdx, watermark: CommitTs) -> ChainPrune {
        // Newest version visible at the watermark; everything older is
        // invisible to every snapshot >= watermark.
        let mut successor = None;
        let mut cursor = Some(head);
        while let Some(idx) = cursor {
            let Some(version) = self.arena.get(idx) else {
                return ChainPrune::default();
            };
            if version.created_at.is_some_and(|c| c <= watermark) {
                break;
            }
            successor = Some(idx);
            cursor = version.prev;
        }
        let Some(anchor) = cursor else {
            return ChainPrune::default();
        };

        let mut reclaimed = 0;
        let mut older = self.arena.get_mut(anchor).and_then(|v| v.prev.take());
        while let Some(idx) = older {
            older = self.arena.free(idx).and_then(|v| v.prev);
            reclaimed += 1;
        }

        let anchor_dead = self
            .arena
            .get(anchor)
            .is_some_and(|v| v.deleted_at.is_some_and(|d| d <= watermark));
        if !anchor_dead {
            return ChainPrune {
                reclaimed,
                dead_head: false,
            };
        }
        match successor {
            Some(newer) => {
                if let Some(v) = self.arena.get_mut(newer) {
                    v.prev = None;
                }
                self.arena.free(anchor);
                ChainPrune {
                    reclaimed: reclaimed + 1,
                    dead_head: false,
                }
            }
            None => ChainPrune {
                reclaimed,
                dead_head: true,
            },
        }
    }
}

/// Result of one [`VersionStore::gc`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub watermark: CommitTs,
    pub rows_examined: usize,
    pub versions_reclaimed: usize,
    pub rows_purged: usize,
}

/// Sharded version store with an ordered per-table key index.
///
/// Lock order: shard, then key index. The quarantine set is never held
/// together with either.
pub struct VersionStore {
    shards: Box<[RwLock<VersionShard>; VERSION_STORE_SHARDS]>,
    keys: RwLock<HashMap<TableId, BTreeSet<u64>>>,
    quarantined: RwLock<HashSet<RowKey>>,
}

impl VersionStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: Box::new(std::array::from_fn(|_| RwLock::new(VersionShard::default()))),
            keys: RwLock::new(HashMap::new()),
            quarantined: RwLock::new(HashSet::new()),
        }
    }

    #[inline]
    fn shard(&self, row: RowKey) -> &RwLock<VersionShard> {
        let mixed = row.key ^ (u64::from(row.table.get()) << 40);
        #[allow(clippy::cast_possible_truncation)] // top 6 bits only
        let idx = (mixed.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 58) as usize;
        &self.shards[idx % VERSION_STORE_SHARDS]
    }

    fn remember_key(&self, row: RowKey) {
        self.keys
            .write()
            .entry(row.table)
            .or_default()
            .insert(row.key);
    }

    fn forget_key(&self, row: RowKey) {
        let mut keys = self.keys.write();
        if let Some(set) = keys.get_mut(&row.table) {
            set.remove(&row.key);
            if set.is_empty() {
                keys.remove(&row.table);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Newest version of `row` visible at `snapshot`. Never blocks on
    /// transactional locks.
    #[must_use]
    pub fn read(&self, row: RowKey, snapshot: CommitTs) -> Option<Payload> {
        self.read_as(row, snapshot, None)
    }

    /// Like [`Self::read`], but a pending write or delete by `reader` wins
    /// over the snapshot.
    #[must_use]
    pub fn read_as(
        &self,
        row: RowKey,
        snapshot: CommitTs,
        reader: Option<TxnId>,
    ) -> Option<Payload> {
        let (payload, traversed) = self.shard(row).read().resolve(row, snapshot, reader);
        record_versions_traversed(traversed);
        trace!(%row, %snapshot, traversed, found = payload.is_some(), "version resolved");
        payload
    }

    /// Latest committed value (plus `reader`'s own effects).
    #[must_use]
    pub fn read_latest(&self, row: RowKey, reader: Option<TxnId>) -> Option<Payload> {
        self.read_as(row, LATEST, reader)
    }

    /// Visible rows of `range`, in key order.
    #[must_use]
    pub fn scan(
        &self,
        range: KeyRange,
        snapshot: CommitTs,
        reader: Option<TxnId>,
    ) -> Vec<(RowKey, Payload)> {
        self.keys_in(range)
            .into_iter()
            .filter_map(|key| {
                let row = RowKey::new(range.table, key);
                self.read_as(row, snapshot, reader).map(|p| (row, p))
            })
            .collect()
    }

    /// Every key in `range` that has a version chain, live or not.
    #[must_use]
    pub fn keys_in(&self, range: KeyRange) -> Vec<u64> {
        if range.is_empty() {
            return Vec::new();
        }
        self.keys
            .read()
            .get(&range.table)
            .map(|set| set.range(range.low..=range.high).copied().collect())
            .unwrap_or_default()
    }

    /// Smallest key of `table` strictly greater than `after`.
    #[must_use]
    pub fn next_key(&self, table: TableId, after: u64) -> Option<u64> {
        self.keys
            .read()
            .get(&table)?
            .range((Bound::Excluded(after), Bound::Unbounded))
            .next()
            .copied()
    }

    /// Whether `row` has a version chain.
    #[must_use]
    pub fn contains(&self, row: RowKey) -> bool {
        self.shard(row).read().heads.contains_key(&row)
    }

    /// Transaction with an uncommitted write or delete on `row`.
    #[must_use]
    pub fn pending_writer(&self, row: RowKey) -> Option<TxnId> {
        let shard = self.shard(row).read();
        let head = shard.arena.get(*shard.heads.get(&row)?)?;
        if head.is_pending() {
            Some(head.created_by)
        } else {
            head.pending_delete()
        }
    }

    /// Number of versions in `row`'s chain.
    #[must_use]
    pub fn chain_len(&self, row: RowKey) -> usize {
        let shard = self.shard(row).read();
        let mut len = 0;
        let mut cursor = shard.heads.get(&row).copied();
        while let Some(idx) = cursor {
            let Some(version) = shard.arena.get(idx) else {
                break;
            };
            len += 1;
            cursor = version.prev;
        }
        len
    }

    #[must_use]
    pub fn version_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().arena.live()).sum()
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().heads.len()).sum()
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Append a pending version of `row` created by `txn`.
    ///
    /// A second write by the same transaction replaces its pending payload.
    /// Fails with `WriteConflict` if another transaction has an uncommitted
    /// write or delete on the row.
    pub fn write(&self, row: RowKey, txn: TxnId, payload: Payload) -> Result<VersionHandle> {
        let handle = VersionHandle { row_key: row, txn };
        let mut guard = self.shard(row).write();
        let shard = &mut *guard;

        let Some(head_idx) = shard.heads.get(&row).copied() else {
            let idx = shard.arena.alloc(Version::pending(row, payload, txn));
            shard.heads.insert(row, idx);
            self.remember_key(row);
            return Ok(handle);
        };

        let head = shard
            .arena
            .get_mut(head_idx)
            .ok_or_else(|| EngineError::internal(format!("dangling chain head for {row}")))?;
        if head.is_pending() {
            if head.created_by != txn {
                return Err(EngineError::WriteConflict {
                    row,
                    holder: head.created_by,
                });
            }
            head.payload = payload;
            return Ok(handle);
        }
        match head.pending_delete() {
            Some(holder) if holder != txn => {
                return Err(EngineError::WriteConflict { row, holder });
            }
            None if head.deleted_at.is_none() => head.deleted_by = Some(txn),
            _ => {}
        }

        let mut version = Version::pending(row, payload, txn);
        version.prev = Some(head_idx);
        let idx = shard.arena.alloc(version);
        shard.heads.insert(row, idx);
        Ok(handle)
    }

    /// Expire the newest version of `row` on behalf of `txn`.
    ///
    /// Returns `None` when there was nothing live to delete.
    pub fn delete(&self, row: RowKey, txn: TxnId) -> Result<Option<VersionHandle>> {
        let handle = VersionHandle { row_key: row, txn };
        let mut guard = self.shard(row).write();
        let shard = &mut *guard;

        let Some(head_idx) = shard.heads.get(&row).copied() else {
            return Ok(None);
        };
        let head = shard
            .arena
            .get_mut(head_idx)
            .ok_or_else(|| EngineError::internal(format!("dangling chain head for {row}")))?;

        if head.is_pending() {
            if head.created_by != txn {
                return Err(EngineError::WriteConflict {
                    row,
                    holder: head.created_by,
                });
            }
            // Deleting our own insert or update: drop the pending version and
            // leave the expiry we already placed on its predecessor.
            let prev = head.prev;
            shard.arena.free(head_idx);
            match prev {
                Some(p) => {
                    shard.heads.insert(row, p);
                }
                None => {
                    shard.heads.remove(&row);
                    self.forget_key(row);
                }
            }
            return Ok(Some(handle));
        }

        match head.pending_delete() {
            Some(holder) if holder != txn => Err(EngineError::WriteConflict { row, holder }),
            Some(_) => Ok(None),
            None if head.deleted_at.is_some() => Ok(None),
            None => {
                head.deleted_by = Some(txn);
                Ok(Some(handle))
            }
        }
    }

    /// Stamp `commit_ts` on the versions `handle` names, making them visible
    /// to snapshots `>= commit_ts`.
    pub fn finalize(&self, handle: VersionHandle, commit_ts: CommitTs) {
        let mut guard = self.shard(handle.row_key).write();
        let shard = &mut *guard;
        let mut cursor = shard.heads.get(&handle.row_key).copied();
        // At most the pending head and the version it supersedes.
        for _ in 0..2 {
            let Some(version) = cursor.and_then(|idx| shard.arena.get_mut(idx)) else {
                break;
            };
            if version.is_pending() {
                if version.created_by != handle.txn {
                    break;
                }
                version.created_at = Some(commit_ts);
            }
            if version.pending_delete() == Some(handle.txn) {
                version.deleted_at = Some(commit_ts);
            }
            cursor = version.prev;
        }
    }

    /// Undo everything `handle` names.
    pub fn discard(&self, handle: VersionHandle) {
        let row = handle.row_key;
        let mut guard = self.shard(row).write();
        let shard = &mut *guard;
        let Some(mut head_idx) = shard.heads.get(&row).copied() else {
            return;
        };

        let own_pending = shard
            .arena
            .get(head_idx)
            .is_some_and(|v| v.is_pending() && v.created_by == handle.txn);
        if own_pending {
            let prev = shard.arena.free(head_idx).and_then(|v| v.prev);
            match prev {
                Some(p) => {
                    shard.heads.insert(row, p);
                    head_idx = p;
                }
                None => {
                    shard.heads.remove(&row);
                    self.forget_key(row);
                    return;
                }
            }
        }

        if let Some(head) = shard.arena.get_mut(head_idx) {
            if head.pending_delete() == Some(handle.txn) {
                head.deleted_by = None;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Garbage collection
    // -----------------------------------------------------------------------

    /// Reclaim versions no snapshot `>= watermark` can observe.
    ///
    /// Rows whose newest version was deleted at or before the watermark are
    /// purged entirely only when `can_purge` allows it; a purged key stops
    /// bounding a gap, so the caller vetoes keys that locks still refer to.
    pub fn gc(&self, watermark: CommitTs, can_purge: impl Fn(RowKey) -> bool) -> GcReport {
        let mut report = GcReport {
            watermark,
            ..GcReport::default()
        };
        for lock in self.shards.iter() {
            let mut guard = lock.write();
            let shard = &mut *guard;
            let heads: Vec<(RowKey, VersionIdx)> =
                shard.heads.iter().map(|(r, i)| (*r, *i)).collect();
            for (row, head) in heads {
                report.rows_examined += 1;
                let prune = shard.prune_chain(head, watermark);
                report.versions_reclaimed += prune.reclaimed;
                if prune.dead_head && can_purge(row) {
                    shard.arena.free(head);
                    shard.heads.remove(&row);
                    self.forget_key(row);
                    report.versions_reclaimed += 1;
                    report.rows_purged += 1;
                }
            }
        }
        record_gc_reclaimed(report.versions_reclaimed as u64);
        debug!(
            %watermark,
            reclaimed = report.versions_reclaimed,
            purged = report.rows_purged,
            "version gc pass"
        );
        report
    }

    // -----------------------------------------------------------------------
    // Quarantine
    // -----------------------------------------------------------------------

    /// Fence `row` off. Returns `true` if it was not already fenced.
    pub fn quarantine(&self, row: RowKey) -> bool {
        self.quarantined.write().insert(row)
    }

    #[must_use]
    pub fn is_quarantined(&self, row: RowKey) -> bool {
        self.quarantined.read().contains(&row)
    }

    /// Lowest fenced row inside `range`.
    #[must_use]
    pub fn quarantined_in(&self, range: KeyRange) -> Option<RowKey> {
        self.quarantined
            .read()
            .iter()
            .copied()
            .filter(|row| range.contains(*row))
            .min()
    }

    #[must_use]
    pub fn quarantined_rows(&self) -> Vec<RowKey> {
        let mut rows: Vec<RowKey> = self.quarantined.read().iter().copied().collect();
        rows.sort_unstable();
        rows
    }
}

impl Default for VersionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VersionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionStore")
            .field("rows", &self.row_count())
            .field("versions", &self.version_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn txn(n: u64) -> TxnId {
        TxnId::new(n).unwrap()
    }

    fn row(k: u64) -> RowKey {
        RowKey::new(TableId::new(1), k)
    }

    fn ts(n: u64) -> CommitTs {
        CommitTs::new(n)
    }

    fn val(v: i64) -> Payload {
        Payload::from_i64(v)
    }

    /// Write and commit `v` to `row` as `t` at `commit`.
    fn commit_write(store: &VersionStore, r: RowKey, t: u64, v: i64, commit: u64) {
        let h = store.write(r, txn(t), val(v)).unwrap();
        store.finalize(h, ts(commit));
    }

    #[test]
    fn pending_versions_are_invisible_to_others() {
        let store = VersionStore::new();
        let h = store.write(row(1), txn(1), val(10)).unwrap();
        assert_eq!(store.read(row(1), ts(100)), None);
        assert_eq!(store.read_as(row(1), ts(0), Some(txn(1))), Some(val(10)));
        assert_eq!(store.pending_writer(row(1)), Some(txn(1)));

        store.finalize(h, ts(1));
        assert_eq!(store.read(row(1), ts(0)), None);
        assert_eq!(store.read(row(1), ts(1)), Some(val(10)));
        assert_eq!(store.pending_writer(row(1)), None);
    }

    #[test]
    fn snapshot_selects_version_from_chain() {
        let store = VersionStore::new();
        commit_write(&store, row(1), 1, 100, 1);
        commit_write(&store, row(1), 2, 200, 5);
        commit_write(&store, row(1), 3, 300, 9);

        assert_eq!(store.chain_len(row(1)), 3);
        assert_eq!(store.read(row(1), ts(0)), None);
        assert_eq!(store.read(row(1), ts(4)), Some(val(100)));
        assert_eq!(store.read(row(1), ts(5)), Some(val(200)));
        assert_eq!(store.read(row(1), ts(8)), Some(val(200)));
        assert_eq!(store.read_latest(row(1), None), Some(val(300)));
    }

    #[test]
    fn second_pending_writer_conflicts() {
        let store = VersionStore::new();
        commit_write(&store, row(1), 1, 1, 1);
        store.write(row(1), txn(2), val(2)).unwrap();
        let err = store.write(row(1), txn(3), val(3)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::WriteConflict { holder, .. } if holder == txn(2)
        ));
        let err = store.delete(row(1), txn(3)).unwrap_err();
        assert!(matches!(err, EngineError::WriteConflict { .. }));
    }

    #[test]
    fn rewrite_by_same_txn_replaces_pending_payload() {
        let store = VersionStore::new();
        store.write(row(1), txn(1), val(1)).unwrap();
        store.write(row(1), txn(1), val(2)).unwrap();
        assert_eq!(store.chain_len(row(1)), 1);
        assert_eq!(store.read_latest(row(1), Some(txn(1))), Some(val(2)));
    }

    #[test]
    fn delete_then_commit_hides_row_from_later_snapshots() {
        let store = VersionStore::new();
        commit_write(&store, row(1), 1, 7, 1);
        let h = store.delete(row(1), txn(2)).unwrap().unwrap();
        assert_eq!(store.read_as(row(1), ts(1), Some(txn(2))), None);
        assert_eq!(store.read(row(1), ts(1)), Some(val(7)));
        assert_eq!(store.pending_writer(row(1)), Some(txn(2)));

        store.finalize(h, ts(2));
        assert_eq!(store.read(row(1), ts(1)), Some(val(7)));
        assert_eq!(store.read(row(1), ts(2)), None);
        assert!(store.delete(row(1), txn(3)).unwrap().is_none());
    }

    #[test]
    fn own_delete_hides_row_even_when_snapshot_predates_head() {
        let store = VersionStore::new();
        commit_write(&store, row(1), 1, 1, 1);
        commit_write(&store, row(1), 2, 2, 5);
        // Reader's snapshot (3) predates the head, but its own delete wins.
        store.delete(row(1), txn(9)).unwrap().unwrap();
        assert_eq!(store.read_as(row(1), ts(3), Some(txn(9))), None);
        assert_eq!(store.read(row(1), ts(3)), Some(val(1)));
    }

    #[test]
    fn deleting_own_insert_removes_the_key() {
        let store = VersionStore::new();
        let t = TableId::new(1);
        store.write(row(5), txn(1), val(5)).unwrap();
        assert_eq!(store.keys_in(KeyRange::all(t)), vec![5]);
        assert!(store.delete(row(5), txn(1)).unwrap().is_some());
        assert!(!store.contains(row(5)));
        assert!(store.keys_in(KeyRange::all(t)).is_empty());
    }

    #[test]
    fn update_then_delete_in_one_txn_expires_original() {
        let store = VersionStore::new();
        commit_write(&store, row(1), 1, 1, 1);
        store.write(row(1), txn(2), val(2)).unwrap();
        let h = store.delete(row(1), txn(2)).unwrap().unwrap();
        assert_eq!(store.read_as(row(1), ts(1), Some(txn(2))), None);
        store.finalize(h, ts(2));
        assert_eq!(store.read(row(1), ts(2)), None);
        assert_eq!(store.read(row(1), ts(1)), Some(val(1)));
    }

    #[test]
    fn discard_restores_previous_state() {
        let store = VersionStore::new();
        commit_write(&store, row(1), 1, 1, 1);

        let h = store.write(row(1), txn(2), val(2)).unwrap();
        store.discard(h);
        assert_eq!(store.chain_len(row(1)), 1);
        assert_eq!(store.pending_writer(row(1)), None);
        // The superseded version is live again and writable by others.
        store.write(row(1), txn(3), val(3)).unwrap();

        let fresh = store.write(row(2), txn(4), val(4)).unwrap();
        store.discard(fresh);
        assert!(!store.contains(row(2)));

        let del = store.delete(row(1), txn(3)).unwrap().unwrap();
        store.discard(del);
        assert_eq!(store.read_latest(row(1), None), Some(val(1)));
    }

    #[test]
    fn reinsert_after_committed_delete() {
        let store = VersionStore::new();
        commit_write(&store, row(1), 1, 1, 1);
        let h = store.delete(row(1), txn(2)).unwrap().unwrap();
        store.finalize(h, ts(2));
        commit_write(&store, row(1), 3, 3, 3);
        assert_eq!(store.read(row(1), ts(2)), None);
        assert_eq!(store.read(row(1), ts(3)), Some(val(3)));
    }

    #[test]
    fn scan_and_key_navigation() {
        let store = VersionStore::new();
        let t = TableId::new(1);
        for k in [10, 20, 30, 40] {
            commit_write(&store, row(k), 1, i64::try_from(k).unwrap(), 1);
        }
        store.write(row(25), txn(2), val(25)).unwrap();

        let visible: Vec<u64> = store
            .scan(KeyRange::new(t, 15, 35), ts(1), None)
            .into_iter()
            .map(|(r, _)| r.key)
            .collect();
        assert_eq!(visible, vec![20, 30]);
        let own: Vec<u64> = store
            .scan(KeyRange::new(t, 15, 35), ts(1), Some(txn(2)))
            .into_iter()
            .map(|(r, _)| r.key)
            .collect();
        assert_eq!(own, vec![20, 25, 30]);

        assert_eq!(store.keys_in(KeyRange::new(t, 15, 35)), vec![20, 25, 30]);
        assert!(store.keys_in(KeyRange::new(t, 35, 15)).is_empty());
        assert_eq!(store.next_key(t, 30), Some(40));
        assert_eq!(store.next_key(t, 40), None);
        assert_eq!(store.next_key(TableId::new(2), 0), None);
    }

    #[test]
    fn gc_keeps_versions_visible_at_watermark() {
        let store = VersionStore::new();
        commit_write(&store, row(1), 1, 1, 1);
        commit_write(&store, row(1), 2, 2, 3);
        commit_write(&store, row(1), 3, 3, 6);

        let report = store.gc(ts(4), |_| true);
        assert_eq!(report.versions_reclaimed, 1);
        assert_eq!(store.chain_len(row(1)), 2);
        assert_eq!(store.read(row(1), ts(4)), Some(val(2)));
        assert_eq!(store.read(row(1), ts(6)), Some(val(3)));

        let report = store.gc(ts(6), |_| true);
        assert_eq!(report.versions_reclaimed, 1);
        assert_eq!(store.chain_len(row(1)), 1);
        assert_eq!(store.read(row(1), ts(100)), Some(val(3)));
    }

    #[test]
    fn gc_never_touches_pending_versions() {
        let store = VersionStore::new();
        commit_write(&store, row(1), 1, 1, 1);
        store.write(row(1), txn(2), val(2)).unwrap();
        store.gc(ts(50), |_| true);
        assert_eq!(store.chain_len(row(1)), 2);
        assert_eq!(store.read(row(1), ts(50)), Some(val(1)));
        assert_eq!(store.read_as(row(1), ts(50), Some(txn(2))), Some(val(2)));
    }

    #[test]
    fn gc_purges_dead_rows_only_when_allowed() {
        let store = VersionStore::new();
        commit_write(&store, row(1), 1, 1, 1);
        let h = store.delete(row(1), txn(2)).unwrap().unwrap();
        store.finalize(h, ts(2));

        let report = store.gc(ts(1), |_| true);
        assert_eq!(report.rows_purged, 0, "delete not yet below watermark");

        let report = store.gc(ts(2), |_| false);
        assert_eq!(report.rows_purged, 0);
        assert!(store.contains(row(1)));

        let report = store.gc(ts(2), |_| true);
        assert_eq!(report.rows_purged, 1);
        assert!(!store.contains(row(1)));
        assert_eq!(store.next_key(TableId::new(1), 0), None);
        assert_eq!(store.version_count(), 0);
    }

    #[test]
    fn gc_drops_dead_anchor_under_newer_version() {
        let store = VersionStore::new();
        commit_write(&store, row(1), 1, 1, 1);
        let h = store.delete(row(1), txn(2)).unwrap().unwrap();
        store.finalize(h, ts(2));
        store.write(row(1), txn(3), val(3)).unwrap();

        store.gc(ts(2), |_| true);
        assert_eq!(store.chain_len(row(1)), 1);
        assert_eq!(store.read(row(1), ts(2)), None);
    }

    #[test]
    fn quarantine_is_idempotent() {
        let store = VersionStore::new();
        assert!(store.quarantine(row(3)));
        assert!(!store.quarantine(row(3)));
        assert!(store.is_quarantined(row(3)));
        assert_eq!(store.quarantined_rows(), vec![row(3)]);
    }

    #[test]
    fn quarantined_in_finds_lowest_fenced_row() {
        let store = VersionStore::new();
        store.quarantine(row(7));
        store.quarantine(row(4));
        store.quarantine(RowKey::new(TableId::new(2), 5));
        assert_eq!(store.quarantined_in(KeyRange::new(TableId::new(1), 0, 10)), Some(row(4)));
        assert_eq!(store.quarantined_in(KeyRange::new(TableId::new(1), 5, 10)), Some(row(7)));
        assert_eq!(store.quarantined_in(KeyRange::new(TableId::new(1), 8, 10)), None);
    }

    proptest! {
        #[test]
        fn gc_preserves_reads_at_or_after_watermark(
            commits in prop::collection::vec((0_u64..4, prop::bool::ANY), 1..30),
            watermark_pick in 0_usize..30,
        ) {
            let store = VersionStore::new();
            for (i, (key, is_delete)) in commits.iter().enumerate() {
                let t = txn(i as u64 + 1);
                let commit = ts(i as u64 + 1);
                let handle = if *is_delete {
                    store.delete(row(*key), t).unwrap()
                } else {
                    Some(store.write(row(*key), t, val(i as i64)).unwrap())
                };
                if let Some(h) = handle {
                    store.finalize(h, commit);
                }
            }
            let last = commits.len() as u64;
            let watermark = ts((watermark_pick as u64).min(last));
            let before: Vec<Vec<Option<Payload>>> = (watermark.get()..=last + 1)
                .map(|s| (0..4).map(|k| store.read(row(k), ts(s))).collect())
                .collect();
            store.gc(watermark, |_| true);
            let after: Vec<Vec<Option<Payload>>> = (watermark.get()..=last + 1)
                .map(|s| (0..4).map(|k| store.read(row(k), ts(s))).collect())
                .collect();
            prop_assert_eq!(before, after);
        }
    }
}
