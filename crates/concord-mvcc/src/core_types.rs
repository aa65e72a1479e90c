//! Row versions and the arena that owns them.

use concord_types::{CommitTs, Payload, RowKey, TxnId};

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// One entry in a row's version chain.
///
/// `created_at` is `None` while the creating transaction is pending. A
/// version is expired by setting `deleted_by`; `deleted_at` is stamped when
/// the deleting transaction commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub row_key: RowKey,
    pub payload: Payload,
    pub created_by: TxnId,
    pub created_at: Option<CommitTs>,
    pub deleted_by: Option<TxnId>,
    pub deleted_at: Option<CommitTs>,
    /// Next-older version of the same row.
    pub prev: Option<VersionIdx>,
}

impl Version {
    #[must_use]
    pub fn pending(row_key: RowKey, payload: Payload, created_by: TxnId) -> Self {
        Self {
            row_key,
            payload,
            created_by,
            created_at: None,
            deleted_by: None,
            deleted_at: None,
            prev: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.created_at.is_none()
    }

    /// Expiry requested by a transaction that has not committed yet.
    #[inline]
    #[must_use]
    pub fn pending_delete(&self) -> Option<TxnId> {
        match (self.deleted_by, self.deleted_at) {
            (Some(txn), None) => Some(txn),
            _ => None,
        }
    }
}

/// Visibility rule for committed data: created at or before `snapshot` and
/// not expired at or before it.
#[inline]
#[must_use]
pub fn visible(version: &Version, snapshot: CommitTs) -> bool {
    version.created_at.is_some_and(|c| c <= snapshot)
        && version.deleted_at.is_none_or(|d| d > snapshot)
}

/// Names the versions one transaction produced on one row.
///
/// A transaction leaves at most one pending version and at most one pending
/// expiry per row, both at the head of the chain, so the pair is enough to
/// finalize or discard them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionHandle {
    pub row_key: RowKey,
    pub txn: TxnId,
}

// ---------------------------------------------------------------------------
// VersionIdx / VersionArena
// ---------------------------------------------------------------------------

/// Index into a [`VersionArena`] chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionIdx {
    chunk: u32,
    offset: u32,
}

impl VersionIdx {
    #[inline]
    pub(crate) const fn new(chunk: u32, offset: u32) -> Self {
        Self { chunk, offset }
    }

    #[inline]
    #[must_use]
    pub fn chunk(&self) -> u32 {
        self.chunk
    }

    #[inline]
    #[must_use]
    pub fn offset(&self) -> u32 {
        self.offset
    }
}

/// Number of versions per arena chunk.
const ARENA_CHUNK: usize = 1024;

/// Chunked arena owning every [`Version`] of one store shard.
///
/// Chains link through [`VersionIdx`] rather than references, so freeing a
/// version can never leave a dangling pointer: a stale index resolves to
/// `None`. Freed slots are recycled via a free list.
pub struct VersionArena {
    chunks: Vec<Vec<Option<Version>>>,
    free_list: Vec<VersionIdx>,
    live: usize,
}

impl VersionArena {
    #[must_use]
    pub fn new() -> Self {
        Self {
            chunks: vec![Vec::with_capacity(ARENA_CHUNK)],
            free_list: Vec::new(),
            live: 0,
        }
    }

    pub fn alloc(&mut self, version: Version) -> VersionIdx {
        self.live += 1;
        if let Some(idx) = self.free_list.pop() {
            self.chunks[idx.chunk as usize][idx.offset as usize] = Some(version);
            return idx;
        }

        if self.chunks.last().is_none_or(|c| c.len() >= ARENA_CHUNK) {
            self.chunks.push(Vec::with_capacity(ARENA_CHUNK));
        }
        let chunk_idx = self.chunks.len() - 1;
        let chunk = &mut self.chunks[chunk_idx];
        let offset = chunk.len();
        chunk.push(Some(version));

        #[allow(clippy::cast_possible_truncation)] // chunk count and ARENA_CHUNK fit in u32
        VersionIdx::new(chunk_idx as u32, offset as u32)
    }

    /// Free the slot at `idx`, returning the version it held.
    pub fn free(&mut self, idx: VersionIdx) -> Option<Version> {
        let slot = self
            .chunks
            .get_mut(idx.chunk as usize)?
            .get_mut(idx.offset as usize)?;
        let version = slot.take()?;
        self.live -= 1;
        self.free_list.push(idx);
        Some(version)
    }

    #[must_use]
    pub fn get(&self, idx: VersionIdx) -> Option<&Version> {
        self.chunks
            .get(idx.chunk as usize)?
            .get(idx.offset as usize)?
            .as_ref()
    }

    pub fn get_mut(&mut self, idx: VersionIdx) -> Option<&mut Version> {
        self.chunks
            .get_mut(idx.chunk as usize)?
            .get_mut(idx.offset as usize)?
            .as_mut()
    }

    /// Number of versions currently allocated.
    #[must_use]
    pub fn live(&self) -> usize {
        self.live
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }
}

impl Default for VersionArena {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VersionArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionArena")
            .field("chunk_count", &self.chunks.len())
            .field("live", &self.live)
            .field("free_count", &self.free_list.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_types::TableId;

    fn txn(n: u64) -> TxnId {
        TxnId::new(n).unwrap()
    }

    fn row(k: u64) -> RowKey {
        RowKey::new(TableId::new(1), k)
    }

    fn committed(created: u64, deleted: Option<u64>) -> Version {
        Version {
            created_at: Some(CommitTs::new(created)),
            deleted_by: deleted.map(|_| txn(99)),
            deleted_at: deleted.map(CommitTs::new),
            ..Version::pending(row(1), Payload::from_i64(0), txn(1))
        }
    }

    #[test]
    fn visibility_window() {
        let v = committed(5, Some(9));
        assert!(!visible(&v, CommitTs::new(4)));
        assert!(visible(&v, CommitTs::new(5)));
        assert!(visible(&v, CommitTs::new(8)));
        assert!(!visible(&v, CommitTs::new(9)));

        let pending = Version::pending(row(1), Payload::from_i64(0), txn(1));
        assert!(!visible(&pending, CommitTs::new(u64::MAX)));
    }

    #[test]
    fn pending_delete_only_before_commit() {
        let mut v = committed(1, None);
        assert_eq!(v.pending_delete(), None);
        v.deleted_by = Some(txn(4));
        assert_eq!(v.pending_delete(), Some(txn(4)));
        v.deleted_at = Some(CommitTs::new(2));
        assert_eq!(v.pending_delete(), None);
    }

    #[test]
    fn arena_alloc_free_reuses_slots() {
        let mut arena = VersionArena::new();
        let a = arena.alloc(committed(1, None));
        let b = arena.alloc(committed(2, None));
        assert_ne!(a, b);
        assert_eq!(arena.live(), 2);

        let freed = arena.free(a).unwrap();
        assert_eq!(freed.created_at, Some(CommitTs::new(1)));
        assert!(arena.get(a).is_none());
        assert!(arena.free(a).is_none(), "double free is refused");
        assert_eq!(arena.free_count(), 1);

        let c = arena.alloc(committed(3, None));
        assert_eq!(c, a);
        assert_eq!(arena.live(), 2);
        assert_eq!(arena.get(c).unwrap().created_at, Some(CommitTs::new(3)));
    }

    #[test]
    fn arena_grows_past_one_chunk() {
        let mut arena = VersionArena::new();
        let mut last = None;
        for i in 0..(ARENA_CHUNK as u64 + 5) {
            last = Some(arena.alloc(committed(i, None)));
        }
        let last = last.unwrap();
        assert_eq!(last.chunk(), 1);
        assert_eq!(last.offset(), 4);
        arena.get_mut(last).unwrap().payload = Payload::from_i64(7);
        assert_eq!(arena.get(last).unwrap().payload.as_i64(), Some(7));
    }
}
