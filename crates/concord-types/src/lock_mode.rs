//! Lock modes, the multi-granularity compatibility matrix, and lockable
//! resources.

use std::fmt;

use crate::glossary::{RowKey, TableId};

/// Multi-granularity lock mode.
///
/// There is no SIX mode: combining `Shared` with `IntentionExclusive`
/// yields `Exclusive`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    Exclusive,
}

impl LockMode {
    pub const ALL: [Self; 4] = [
        Self::IntentionShared,
        Self::IntentionExclusive,
        Self::Shared,
        Self::Exclusive,
    ];

    /// Standard compatibility matrix.
    ///
    /// ```text
    ///        IS   IX   S    X
    ///   IS   y    y    y    n
    ///   IX   y    y    n    n
    ///   S    y    n    y    n
    ///   X    n    n    n    n
    /// ```
    #[must_use]
    pub const fn compatible(self, other: Self) -> bool {
        use LockMode::{Exclusive, IntentionExclusive, IntentionShared, Shared};
        match (self, other) {
            (Exclusive, _) | (_, Exclusive) => false,
            (IntentionShared, _) | (_, IntentionShared) => true,
            (IntentionExclusive, IntentionExclusive) | (Shared, Shared) => true,
            (IntentionExclusive, Shared) | (Shared, IntentionExclusive) => false,
        }
    }

    /// Least mode at least as strong as both inputs.
    #[must_use]
    pub const fn supremum(self, other: Self) -> Self {
        use LockMode::{Exclusive, IntentionExclusive, IntentionShared, Shared};
        match (self, other) {
            (Exclusive, _) | (_, Exclusive) => Exclusive,
            (Shared, IntentionExclusive) | (IntentionExclusive, Shared) => Exclusive,
            (Shared, _) | (_, Shared) => Shared,
            (IntentionExclusive, _) | (_, IntentionExclusive) => IntentionExclusive,
            (IntentionShared, IntentionShared) => IntentionShared,
        }
    }

    /// Whether holding `self` already grants everything `requested` would.
    #[must_use]
    pub fn covers(self, requested: Self) -> bool {
        self.supremum(requested) == self
    }

    /// Intention mode a parent granule must hold before `self` is taken on
    /// a child.
    #[must_use]
    pub const fn parent_intention(self) -> Self {
        match self {
            Self::IntentionShared | Self::Shared => Self::IntentionShared,
            Self::IntentionExclusive | Self::Exclusive => Self::IntentionExclusive,
        }
    }

    /// Short mnemonic used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IntentionShared => "IS",
            Self::IntentionExclusive => "IX",
            Self::Shared => "S",
            Self::Exclusive => "X",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A gap between two adjacent keys of a table.
///
/// A gap is named by the key bounding it from above: `upper = Some(k)` is
/// the open interval between `k`'s predecessor and `k`; `upper = None` is
/// the interval above the table's largest key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct Gap {
    pub table: TableId,
    pub upper: Option<u64>,
}

impl Gap {
    #[inline]
    pub const fn below(row: RowKey) -> Self {
        Self {
            table: row.table,
            upper: Some(row.key),
        }
    }

    #[inline]
    pub const fn supremum(table: TableId) -> Self {
        Self { table, upper: None }
    }
}

/// Anything the lock manager can lock.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum LockResource {
    Table(TableId),
    Gap(Gap),
    Row(RowKey),
}

impl LockResource {
    #[must_use]
    pub const fn table(&self) -> TableId {
        match self {
            Self::Table(t) => *t,
            Self::Gap(g) => g.table,
            Self::Row(r) => r.table,
        }
    }

    /// The enclosing granule on which an intention lock is required.
    #[must_use]
    pub const fn parent(&self) -> Option<Self> {
        match self {
            Self::Table(_) => None,
            Self::Gap(g) => Some(Self::Table(g.table)),
            Self::Row(r) => Some(Self::Table(r.table)),
        }
    }
}

impl fmt::Display for LockResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Table(t) => write!(f, "{t}"),
            Self::Gap(Gap {
                table,
                upper: Some(k),
            }) => write!(f, "{table}/gap<{k}"),
            Self::Gap(Gap { table, upper: None }) => write!(f, "{table}/gap<sup"),
            Self::Row(r) => write!(f, "{r}"),
        }
    }
}
