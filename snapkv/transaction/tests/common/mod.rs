#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use snapkv_common::{Cell, TableRef, Timestamp};
use snapkv_storage::{InMemoryKeyValueService, KeyValueService};
use snapkv_transaction::commit_index::TransactionServiceResult;
use snapkv_transaction::{
    CommitEntry, CommitValue, InMemorySweepQueue, InMemoryTimelockService,
    InMemoryTransactionService, SnapshotTransaction, SnapshotTransactionManager,
    TransactionConfig, TransactionManagerBuilder, TransactionService, TransactionServiceError,
};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn table() -> TableRef {
    TableRef::new("test", "data")
}

pub fn cell(row: &str, column: &str) -> Cell {
    Cell::from_slices(row.as_bytes(), column.as_bytes())
}

pub fn value(contents: &str) -> Bytes {
    Bytes::copy_from_slice(contents.as_bytes())
}

/// Commit index whose publications can be made to report an unknown outcome
/// after they were applied.
#[derive(Default)]
pub struct FlakyTransactionService {
    inner: InMemoryTransactionService,
    ambiguous_publications: AtomicBool,
}

impl FlakyTransactionService {
    pub fn set_ambiguous_publications(&self, enabled: bool) {
        self.ambiguous_publications.store(enabled, Ordering::SeqCst);
    }
}

impl TransactionService for FlakyTransactionService {
    fn get(&self, start_ts: Timestamp) -> TransactionServiceResult<Option<CommitEntry>> {
        self.inner.get(start_ts)
    }

    fn mark_in_progress(&self, start_ts: Timestamp) -> TransactionServiceResult<()> {
        self.inner.mark_in_progress(start_ts)
    }

    fn put_unless_exists(
        &self,
        start_ts: Timestamp,
        value: CommitValue,
    ) -> TransactionServiceResult<()> {
        self.inner.put_unless_exists(start_ts, value)?;
        if matches!(value, CommitValue::Committed(_))
            && self.ambiguous_publications.load(Ordering::SeqCst)
        {
            return Err(TransactionServiceError::Ambiguous {
                start_ts,
                reason: "request timed out".into(),
            });
        }
        Ok(())
    }
}

/// A manager over in-memory services, with handles to every service.
pub struct TestEngine {
    pub kvs: Arc<InMemoryKeyValueService>,
    pub timelock: Arc<InMemoryTimelockService>,
    pub commit_index: Arc<FlakyTransactionService>,
    pub sweep_queue: Arc<InMemorySweepQueue>,
    pub manager: SnapshotTransactionManager,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: TransactionConfig) -> Self {
        Self::build(config, |builder| builder)
    }

    pub fn build<F>(config: TransactionConfig, customize: F) -> Self
    where
        F: FnOnce(TransactionManagerBuilder) -> TransactionManagerBuilder,
    {
        init_tracing();
        let kvs = Arc::new(InMemoryKeyValueService::new());
        let timelock = Arc::new(InMemoryTimelockService::with_lease(config.lock_lease));
        let commit_index = Arc::new(FlakyTransactionService::default());
        let sweep_queue = Arc::new(InMemorySweepQueue::new());
        let builder =
            SnapshotTransactionManager::builder(kvs.clone(), timelock.clone(), commit_index.clone())
                .with_sweep_queue(sweep_queue.clone())
                .with_config(config);
        let manager = customize(builder).build().unwrap();
        Self {
            kvs,
            timelock,
            commit_index,
            sweep_queue,
            manager,
        }
    }

    /// Commit `contents` to a single cell in its own transaction.
    pub fn commit_value(&self, cell: &Cell, contents: &str) {
        self.manager
            .run_task_with_retry(|txn| {
                txn.put(&table(), HashMap::from([(cell.clone(), value(contents))]))
            })
            .unwrap();
    }

    /// Write a version straight into the store, as a writer that died after
    /// its durability write would have left it.
    pub fn write_uncommitted(&self, cell: &Cell, contents: &str) -> Timestamp {
        let start_ts = self.manager.fresh_timestamp().unwrap();
        self.kvs
            .multi_put(
                &table(),
                &HashMap::from([(cell.clone(), value(contents))]),
                start_ts,
            )
            .unwrap();
        start_ts
    }

    /// Every version of `cell` in the store, oldest first.
    pub fn versions(&self, cell: &Cell) -> Vec<Timestamp> {
        self.kvs
            .get_all_timestamps(&table(), std::slice::from_ref(cell), Timestamp::MAX)
            .unwrap()
            .remove(cell)
            .unwrap_or_default()
    }
}

/// Short timeouts so that failing tests fail fast.
pub fn test_config() -> TransactionConfig {
    TransactionConfig {
        lock_acquire_timeout: std::time::Duration::from_secs(2),
        retry_backoff: std::time::Duration::from_millis(1),
        ..TransactionConfig::default()
    }
}

pub fn read(txn: &SnapshotTransaction, cell: &Cell) -> Option<Bytes> {
    txn.get_cell(&table(), cell).unwrap()
}

pub fn write(txn: &SnapshotTransaction, cell: &Cell, contents: &str) {
    txn.put(&table(), HashMap::from([(cell.clone(), value(contents))]))
        .unwrap();
}
