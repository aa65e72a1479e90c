//! Classic anomaly scenarios, sequenced deterministically on one thread.

mod common;

use std::thread;
use std::time::Duration;

use common::{engine, int, read_int, row, seed, TABLE};
use concord_mvcc::{
    EngineError, IsolationLevel, KeyRange, SerializationReason, TransactionState,
};

#[test]
fn lost_update_is_allowed_under_repeatable_read() {
    let tm = engine();
    seed(&tm, &[(1, 1000)]);

    let t1 = tm.begin(IsolationLevel::RepeatableRead).unwrap();
    let t2 = tm.begin(IsolationLevel::RepeatableRead).unwrap();
    assert_eq!(read_int(&tm, t1, 1), Some(1000));
    assert_eq!(read_int(&tm, t2, 1), Some(1000));

    tm.write(t1, row(1), int(900)).unwrap();
    tm.commit(t1).unwrap();
    tm.write(t2, row(1), int(800)).unwrap();
    tm.commit(t2).unwrap();

    let r = tm.begin(IsolationLevel::RepeatableRead).unwrap();
    assert_eq!(read_int(&tm, r, 1), Some(800));
}

#[test]
fn lost_update_is_rejected_under_serializable() {
    let tm = engine();
    seed(&tm, &[(1, 1000)]);

    let t1 = tm.begin(IsolationLevel::Serializable).unwrap();
    let t2 = tm.begin(IsolationLevel::Serializable).unwrap();
    assert_eq!(read_int(&tm, t1, 1), Some(1000));
    assert_eq!(read_int(&tm, t2, 1), Some(1000));

    tm.write(t1, row(1), int(900)).unwrap();
    tm.commit(t1).unwrap();
    tm.write(t2, row(1), int(800)).unwrap();
    let err = tm.commit(t2).unwrap_err();
    assert!(
        matches!(err, EngineError::SerializationFailure { txn, .. } if txn == t2),
        "unexpected {err:?}"
    );
    assert_eq!(tm.state(t2), Some(TransactionState::Aborted));

    let r = tm.begin(IsolationLevel::Serializable).unwrap();
    assert_eq!(read_int(&tm, r, 1), Some(900));
}

#[test]
fn phantom_is_invisible_under_repeatable_read() {
    let tm = engine();
    seed(&tm, &[(10, 1), (20, 1), (30, 1), (40, 1), (50, 1)]);
    let range = KeyRange::new(TABLE, 0, 100);

    let t1 = tm.begin(IsolationLevel::RepeatableRead).unwrap();
    assert_eq!(tm.scan(t1, range, false).unwrap().len(), 5);

    let t2 = tm.begin(IsolationLevel::RepeatableRead).unwrap();
    tm.write(t2, row(25), int(1)).unwrap();
    tm.commit(t2).unwrap();

    assert_eq!(tm.scan(t1, range, false).unwrap().len(), 5);
    tm.commit(t1).unwrap();
}

#[test]
fn phantom_fails_serializable_reader_at_commit() {
    let tm = engine();
    seed(&tm, &[(10, 1), (20, 1), (30, 1), (40, 1), (50, 1)]);
    let range = KeyRange::new(TABLE, 0, 100);

    let t1 = tm.begin(IsolationLevel::Serializable).unwrap();
    assert_eq!(tm.scan(t1, range, false).unwrap().len(), 5);

    let t2 = tm.begin(IsolationLevel::Serializable).unwrap();
    tm.write(t2, row(25), int(1)).unwrap();
    tm.commit(t2).unwrap();

    // The snapshot still hides the insert; validation catches it.
    assert_eq!(tm.scan(t1, range, false).unwrap().len(), 5);
    let err = tm.commit(t1).unwrap_err();
    assert!(matches!(
        err,
        EngineError::SerializationFailure {
            reason: SerializationReason::StaleRead,
            ..
        }
    ));
}

#[test]
fn read_committed_sees_newly_committed_rows() {
    let tm = engine();
    seed(&tm, &[(1, 1)]);

    let t1 = tm.begin(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(read_int(&tm, t1, 1), Some(1));

    let t2 = tm.begin(IsolationLevel::ReadCommitted).unwrap();
    tm.write(t2, row(1), int(2)).unwrap();
    tm.write(t2, row(2), int(2)).unwrap();
    tm.commit(t2).unwrap();

    assert_eq!(read_int(&tm, t1, 1), Some(2));
    assert_eq!(read_int(&tm, t1, 2), Some(2));
}

#[test]
fn write_skew_is_rejected_under_serializable() {
    // Constraint: x + y >= 0. Each transaction withdraws from one side
    // after checking both.
    let tm = engine();
    seed(&tm, &[(1, 50), (2, 50)]);

    let t1 = tm.begin(IsolationLevel::Serializable).unwrap();
    let t2 = tm.begin(IsolationLevel::Serializable).unwrap();
    for t in [t1, t2] {
        let sum = read_int(&tm, t, 1).unwrap() + read_int(&tm, t, 2).unwrap();
        assert_eq!(sum, 100);
    }
    tm.write(t1, row(1), int(-50)).unwrap();
    tm.write(t2, row(2), int(-50)).unwrap();

    let first = tm.commit(t1);
    let second = tm.commit(t2);
    assert!(
        first.is_err() || second.is_err(),
        "write skew committed both sides"
    );

    let r = tm.begin(IsolationLevel::Serializable).unwrap();
    let sum = read_int(&tm, r, 1).unwrap() + read_int(&tm, r, 2).unwrap();
    assert!(sum >= 0, "constraint violated: {sum}");
}

#[test]
fn write_skew_commits_under_repeatable_read() {
    let tm = engine();
    seed(&tm, &[(1, 50), (2, 50)]);

    let t1 = tm.begin(IsolationLevel::RepeatableRead).unwrap();
    let t2 = tm.begin(IsolationLevel::RepeatableRead).unwrap();
    for t in [t1, t2] {
        read_int(&tm, t, 1);
        read_int(&tm, t, 2);
    }
    tm.write(t1, row(1), int(-50)).unwrap();
    tm.write(t2, row(2), int(-50)).unwrap();
    tm.commit(t1).unwrap();
    tm.commit(t2).unwrap();
}

#[test]
fn locking_scan_blocks_insert_until_commit() {
    let tm = engine();
    seed(&tm, &[(10, 1), (20, 1), (30, 1)]);
    let range = KeyRange::new(TABLE, 0, 25);

    let reader = tm.begin(IsolationLevel::Serializable).unwrap();
    assert_eq!(tm.scan(reader, range, true).unwrap().len(), 2);

    let inserter = {
        let tm = std::sync::Arc::clone(&tm);
        thread::spawn(move || {
            let t = tm.begin(IsolationLevel::Serializable).unwrap();
            tm.write(t, row(15), int(1)).unwrap();
            tm.commit(t).unwrap();
        })
    };
    while tm.locks().waiting_count() == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(tm.scan(reader, range, true).unwrap().len(), 2);
    tm.commit(reader).unwrap();
    inserter.join().unwrap();

    let after = tm.begin(IsolationLevel::Serializable).unwrap();
    assert_eq!(tm.scan(after, range, false).unwrap().len(), 3);
}

#[test]
fn operations_after_commit_are_rejected() {
    let tm = engine();
    let t = tm.begin(IsolationLevel::RepeatableRead).unwrap();
    tm.commit(t).unwrap();

    let err = tm.write(t, row(1), int(1)).unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidState {
            state: TransactionState::Committed,
            ..
        }
    ));
    assert!(tm.commit(t).is_err());
    tm.rollback(t);
    assert_eq!(tm.state(t), Some(TransactionState::Committed));
}
