//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use concord_mvcc::{
    EngineConfig, EngineError, InMemoryDurabilityLog, IsolationLevel, Payload, RowKey, TableId,
    TransactionManager, TxnId,
};

static TRACING: Once = Once::new();

/// Route engine logs to the test harness. Filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub const TABLE: TableId = TableId::new(1);

pub fn row(key: u64) -> RowKey {
    RowKey::new(TABLE, key)
}

pub fn int(v: i64) -> Payload {
    Payload::from_i64(v)
}

pub fn engine() -> Arc<TransactionManager> {
    engine_with(EngineConfig::default()).0
}

pub fn engine_with(config: EngineConfig) -> (Arc<TransactionManager>, Arc<InMemoryDurabilityLog>) {
    init_tracing();
    let log = Arc::new(InMemoryDurabilityLog::new());
    let tm = TransactionManager::new(config, Arc::clone(&log) as _).expect("engine");
    (Arc::new(tm), log)
}

/// Commit `(key, value)` pairs in one Serializable transaction.
pub fn seed(tm: &TransactionManager, rows: &[(u64, i64)]) {
    let t = tm.begin(IsolationLevel::Serializable).expect("begin");
    for &(k, v) in rows {
        tm.write(t, row(k), int(v)).expect("seed write");
    }
    tm.commit(t).expect("seed commit");
}

pub fn read_int(tm: &TransactionManager, txn: TxnId, key: u64) -> Option<i64> {
    tm.read(txn, row(key), false)
        .expect("read")
        .and_then(|p| p.as_i64())
}

/// Run `body` in fresh transactions until one commits. Returns the number
/// of attempts.
pub fn retry<F>(tm: &TransactionManager, level: IsolationLevel, mut body: F) -> usize
where
    F: FnMut(&TransactionManager, TxnId) -> Result<(), EngineError>,
{
    for attempt in 1.. {
        let t = tm.begin(level).expect("begin");
        let outcome = body(tm, t).and_then(|()| tm.commit(t).map(drop));
        match outcome {
            Ok(()) => return attempt,
            Err(err) if err.is_transient() => continue,
            Err(err) => panic!("non-transient error on attempt {attempt}: {err}"),
        }
    }
    unreachable!()
}
