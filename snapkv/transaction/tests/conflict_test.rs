mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use common::*;
use snapkv_common::TableRef;
use snapkv_storage::KeyValueService;
use snapkv_transaction::{
    ChangeMetadata, CommitValue, ConflictHandler, ErrorKind, LockDescriptor, SweepStrategy,
    TableMetadata, Timestamp, Transaction, TransactionError, TransactionManager,
    TransactionResult, TransactionService, TransactionState,
};

fn conflict_counts(err: &TransactionError) -> (usize, usize) {
    match err {
        TransactionError::WriteWriteConflict {
            spanning,
            dominating,
            ..
        } => (spanning.len(), dominating.len()),
        other => panic!("expected a write-write conflict, got {other:?}"),
    }
}

// ========== WRITE-WRITE CONFLICT TESTS ==========

#[test]
fn test_second_committer_conflicts() {
    let engine = TestEngine::new();
    let c = cell("a", "x");

    let t1 = engine.manager.begin_transaction().unwrap();
    let t2 = engine.manager.begin_transaction().unwrap();
    write(&t1, &c, "t1");
    write(&t2, &c, "t2");

    t1.commit().unwrap();
    let err = t2.commit().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(err.is_retriable());
    assert_eq!(t2.state(), TransactionState::Failed);
    assert_eq!(t2.commit_ts(), None);

    let reader = engine.manager.begin_transaction().unwrap();
    assert_eq!(read(&reader, &c), Some(value("t1")));
    // The loser never reached the store.
    assert_eq!(engine.versions(&c), vec![t1.start_ts()]);
}

#[test]
fn test_dominating_conflict() {
    let engine = TestEngine::new();
    let c = cell("a", "x");

    let older = engine.manager.begin_transaction().unwrap();
    let newer = engine.manager.begin_transaction().unwrap();
    write(&newer, &c, "newer");
    newer.commit().unwrap();

    write(&older, &c, "older");
    let err = older.commit().unwrap_err();
    assert_eq!(conflict_counts(&err), (0, 1));
}

#[test]
fn test_spanning_conflict() {
    let engine = TestEngine::new();
    let c = cell("a", "x");

    let first = engine.manager.begin_transaction().unwrap();
    let second = engine.manager.begin_transaction().unwrap();
    write(&first, &c, "first");
    first.commit().unwrap();

    write(&second, &c, "second");
    let err = second.commit().unwrap_err();
    assert_eq!(conflict_counts(&err), (1, 0));
}

#[test]
fn test_disjoint_writes_both_commit() {
    let engine = TestEngine::new();
    let t1 = engine.manager.begin_transaction().unwrap();
    let t2 = engine.manager.begin_transaction().unwrap();
    write(&t1, &cell("a", "x"), "1");
    write(&t2, &cell("b", "x"), "2");
    t1.commit().unwrap();
    t2.commit().unwrap();
}

#[test]
fn test_write_after_earlier_commit_is_not_conflict() {
    let engine = TestEngine::new();
    let c = cell("a", "x");
    engine.commit_value(&c, "before");

    let txn = engine.manager.begin_transaction().unwrap();
    write(&txn, &c, "after");
    txn.commit().unwrap();
}

#[test]
fn test_conflict_skips_rolled_back_writer() {
    let engine = TestEngine::new();
    let c = cell("a", "x");
    engine.commit_value(&c, "base");

    let txn = engine.manager.begin_transaction().unwrap();
    // A crashed writer that started after us; nobody holds its commit lock.
    engine.write_uncommitted(&c, "garbage");

    write(&txn, &c, "mine");
    txn.commit().unwrap();

    let reader = engine.manager.begin_transaction().unwrap();
    assert_eq!(read(&reader, &c), Some(value("mine")));
}

#[test]
fn test_ignore_all_handler_never_conflicts() {
    let engine = TestEngine::build(test_config(), |builder| {
        builder.with_table(
            table(),
            TableMetadata::new(ConflictHandler::IgnoreAll, SweepStrategy::Conservative),
        )
    });
    let c = cell("a", "x");

    let t1 = engine.manager.begin_transaction().unwrap();
    let t2 = engine.manager.begin_transaction().unwrap();
    write(&t1, &c, "t1");
    write(&t2, &c, "t2");
    t1.commit().unwrap();
    t2.commit().unwrap();

    let reader = engine.manager.begin_transaction().unwrap();
    assert_eq!(read(&reader, &c), Some(value("t2")));
}

#[test]
fn test_conflicts_are_per_table() {
    let engine = TestEngine::new();
    let other = TableRef::new("test", "other");
    let c = cell("a", "x");

    let t1 = engine.manager.begin_transaction().unwrap();
    let t2 = engine.manager.begin_transaction().unwrap();
    write(&t1, &c, "t1");
    t2.put(&other, HashMap::from([(c.clone(), value("t2"))]))
        .unwrap();
    t1.commit().unwrap();
    t2.commit().unwrap();
}

// ========== UNCHANGED VALUE TESTS ==========

#[test]
fn test_unchanged_value_conflict_is_ignored() {
    let engine = TestEngine::build(test_config(), |builder| {
        builder.with_table(
            table(),
            TableMetadata::new(ConflictHandler::RetryOnValueChanged, SweepStrategy::Conservative),
        )
    });
    let c = cell("a", "x");
    engine.commit_value(&c, "same");

    let t1 = engine.manager.begin_transaction().unwrap();
    let t2 = engine.manager.begin_transaction().unwrap();
    write(&t1, &c, "same");
    write(&t2, &c, "same");
    t1.commit().unwrap();
    t2.commit().unwrap();
}

#[test]
fn test_changed_value_still_conflicts() {
    let engine = TestEngine::build(test_config(), |builder| {
        builder.with_table(
            table(),
            TableMetadata::new(ConflictHandler::RetryOnValueChanged, SweepStrategy::Conservative),
        )
    });
    let c = cell("a", "x");
    engine.commit_value(&c, "same");

    let t1 = engine.manager.begin_transaction().unwrap();
    let t2 = engine.manager.begin_transaction().unwrap();
    write(&t1, &c, "changed");
    write(&t2, &c, "same");
    t1.commit().unwrap();
    let err = t2.commit().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[test]
fn test_default_handler_conflicts_on_identical_values() {
    let engine = TestEngine::new();
    let c = cell("a", "x");
    engine.commit_value(&c, "same");

    let t1 = engine.manager.begin_transaction().unwrap();
    let t2 = engine.manager.begin_transaction().unwrap();
    write(&t1, &c, "same");
    write(&t2, &c, "same");
    t1.commit().unwrap();
    assert_eq!(t2.commit().unwrap_err().kind(), ErrorKind::Conflict);
}

// ========== COMMIT LOCK TESTS ==========

#[test]
fn test_row_locks_block_committers() {
    let engine = TestEngine::with_config(snapkv_transaction::TransactionConfig {
        lock_acquire_timeout: std::time::Duration::from_millis(50),
        ..test_config()
    });
    let c = cell("a", "x");

    // Someone else holds the row lock.
    let request = snapkv_transaction::LockRequest::new(std::time::Duration::ZERO)
        .with_descriptors([LockDescriptor::row(&table(), b"a")]);
    let token = engine.timelock.locks().acquire(&request).unwrap();

    let txn = engine.manager.begin_transaction().unwrap();
    write(&txn, &c, "blocked");
    let err = txn.commit().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockTimeout);
    assert!(engine.versions(&c).is_empty());

    engine.timelock.locks().release(&[token]);
}

#[test]
fn test_cell_locks_carry_change_metadata() {
    let engine = TestEngine::build(test_config(), |builder| {
        builder.with_table(
            table(),
            TableMetadata::new(ConflictHandler::RetryOnWriteWriteCell, SweepStrategy::Conservative),
        )
    });
    let c = cell("a", "x");
    let descriptor = LockDescriptor::cell(&table(), &c);

    // The first check runs before locking, the second one while the locks
    // are held.
    let observed = Arc::new(Mutex::new(Vec::new()));
    let condition = {
        let timelock = engine.timelock.clone();
        let observed = observed.clone();
        let descriptor = descriptor.clone();
        move |_ts: Timestamp| -> TransactionResult<()> {
            observed
                .lock()
                .unwrap()
                .push(timelock.locks().metadata(&descriptor));
            Ok(())
        }
    };
    let txn = engine
        .manager
        .begin_transaction_with_condition(Box::new(condition))
        .unwrap();
    let change = ChangeMetadata::Created { new: value("new") };
    txn.put_with_metadata(
        &table(),
        HashMap::from([(c.clone(), value("new"))]),
        HashMap::from([(c.clone(), change.clone())]),
    )
    .unwrap();
    txn.commit().unwrap();

    assert_eq!(*observed.lock().unwrap(), vec![None, Some(change)]);
    assert_eq!(engine.timelock.locks().holder(&descriptor), None);
}

#[test]
fn test_metadata_for_unwritten_cell_rejected() {
    let engine = TestEngine::new();
    let txn = engine.manager.begin_transaction().unwrap();
    let err = txn
        .put_with_metadata(
            &table(),
            HashMap::from([(cell("a", "x"), value("v"))]),
            HashMap::from([(
                cell("a", "y"),
                ChangeMetadata::Deleted { old: value("v") },
            )]),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);
}

#[test]
fn test_concurrent_committers_one_wins() {
    let engine = TestEngine::new();
    let c = cell("a", "x");
    let transactions: Vec<_> = (0..4)
        .map(|i| {
            let txn = engine.manager.begin_transaction().unwrap();
            write(&txn, &c, &format!("v{i}"));
            txn
        })
        .collect();

    let handles: Vec<_> = transactions
        .into_iter()
        .map(|txn| thread::spawn(move || txn.commit().is_ok()))
        .collect();
    let committed = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .filter(|ok| *ok)
        .count();
    assert_eq!(committed, 1);
}

// ========== TIMESTAMP REUSE TESTS ==========

#[test]
fn test_foreign_version_at_own_start_is_fatal() {
    let engine = TestEngine::new();
    let c = cell("a", "x");
    let txn = engine.manager.begin_transaction().unwrap();
    write(&txn, &c, "mine");

    // Someone else wrote with our start timestamp.
    engine
        .kvs
        .multi_put(
            &table(),
            &HashMap::from([(c.clone(), value("foreign"))]),
            txn.start_ts(),
        )
        .unwrap();

    let err = txn.commit().unwrap_err();
    assert!(
        matches!(err, TransactionError::TimestampReuse { start_ts, .. } if start_ts == txn.start_ts()),
        "unexpected error {err:?}"
    );
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert!(!err.is_retriable());
    assert_eq!(txn.state(), TransactionState::Failed);
}

#[test]
fn test_writer_committed_at_own_start_is_fatal() {
    let engine = TestEngine::new();
    let c = cell("a", "x");
    let other = engine.write_uncommitted(&c, "other");
    let txn = engine.manager.begin_transaction().unwrap();
    engine
        .commit_index
        .put_unless_exists(other, CommitValue::Committed(txn.start_ts()))
        .unwrap();

    write(&txn, &c, "mine");
    let err = txn.commit().unwrap_err();
    assert!(
        matches!(err, TransactionError::TimestampReuse { ref cell, .. } if *cell == c),
        "unexpected error {err:?}"
    );
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert_eq!(txn.state(), TransactionState::Failed);
    assert_eq!(engine.versions(&c), vec![other]);
}
