//! Multi-version concurrency control for a row-oriented storage engine.
//!
//! The pieces compose bottom-up:
//!
//! - [`VersionStore`] keeps per-row version chains and answers snapshot reads.
//! - [`LockManager`] grants multi-granularity row, gap and table locks with
//!   FIFO waiting; [`DeadlockDetector`] breaks cycles in its wait-for graph.
//! - [`ConflictTracker`] records read/write footprints and rejects
//!   non-serializable commits.
//! - [`TransactionManager`] ties them together behind begin, read, write,
//!   commit and rollback.
//!
//! Durability is delegated to a [`DurabilityLog`] supplied by the caller.

pub mod config;
pub mod conflict_tracker;
pub mod core_types;
pub mod deadlock;
pub mod durability;
pub mod gc;
pub mod lifecycle;
pub mod lock_manager;
pub mod observability;
pub mod version_store;

pub use concord_error::{EngineError, ErrorCode, Result, SerializationReason};
pub use concord_types::{
    CommitTs, Gap, IsolationLevel, KeyRange, LockMode, LockResource, Payload, RowKey, TableId,
    TransactionState, TxnId,
};
pub use config::EngineConfig;
pub use conflict_tracker::{ConflictTracker, DiscoveredEdge, Footprint, Validation};
pub use core_types::{Version, VersionArena, VersionHandle, VersionIdx, visible};
pub use deadlock::{CycleSearch, DeadlockDetector, WaitForGraph, select_victim};
pub use durability::{
    CommitRecord, DurabilityError, DurabilityLog, GarbageCollector, InMemoryDurabilityLog,
    NullDurabilityLog, RowChange,
};
pub use gc::{GcScheduler, chain_pressure};
pub use lifecycle::{AbortCause, AbortStats, EngineStats, TransactionManager};
pub use lock_manager::{LOCK_SHARDS, LockManager, LockOutcome};
pub use observability::{
    EngineMetricsSnapshot, EventSink, SharedObserver, engine_metrics_snapshot,
    reset_engine_metrics,
};
pub use version_store::{GcReport, LATEST, VERSION_STORE_SHARDS, VersionStore};
