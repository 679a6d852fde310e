//! Transaction manager trait and the snapshot transaction manager.
//!
//! The manager owns the services shared by its transactions and hands out
//! transactions with a fresh start timestamp and a lock on the immutable
//! timestamp. It also offers retry loops for tasks that should simply be run
//! again after a retriable failure.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;
use snapkv_common::TableRef;
use snapkv_storage::KeyValueService;
use tracing::{debug, info};

use crate::cache::CommitTimestampCache;
use crate::cleaner::GarbageCleaner;
use crate::commit_index::{CommitEntry, TransactionService};
use crate::condition::{LockTokensCondition, NoOpCondition, PreCommitCondition};
use crate::config::TransactionConfig;
use crate::context::EngineContext;
use crate::error::{TransactionError, TransactionResult};
use crate::lock::{LockDescriptor, LockRequest};
use crate::rollback::CommitStatusResolver;
use crate::sweep::{NoOpSweepQueue, SweepQueueWriter};
use crate::table::{TableMetadata, TableRegistry};
use crate::timelock::TimelockService;
use crate::timestamp::Timestamp;
use crate::transaction::{SnapshotTransaction, Transaction};
use crate::validation::{CommitValidator, ConstraintCheck, SnapshotIsolationValidator};

/// Trait for transaction managers supporting MVCC operations.
pub trait TransactionManager {
    /// The transaction type that this manager handles
    type Transaction: Transaction + Send + Sync;
    /// The error type for operations
    type Error;

    /// Begin a new transaction and return it.
    fn begin_transaction(&self) -> Result<Arc<Self::Transaction>, Self::Error>;

    /// The smallest start timestamp any live transaction may still read at.
    /// Versions needed by such a reader must survive garbage collection.
    fn immutable_timestamp(&self) -> Result<Timestamp, Self::Error>;
}

pub struct TransactionManagerBuilder {
    kvs: Arc<dyn KeyValueService>,
    timelock: Arc<dyn TimelockService>,
    commit_index: Arc<dyn TransactionService>,
    sweep_queue: Arc<dyn SweepQueueWriter>,
    cache: Option<Arc<CommitTimestampCache>>,
    validator: Arc<dyn CommitValidator>,
    constraints: Vec<Arc<dyn ConstraintCheck>>,
    tables: Vec<(TableRef, TableMetadata)>,
    config: TransactionConfig,
}

impl TransactionManagerBuilder {
    pub fn with_config(mut self, config: TransactionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_sweep_queue(mut self, sweep_queue: Arc<dyn SweepQueueWriter>) -> Self {
        self.sweep_queue = sweep_queue;
        self
    }

    /// Share a commit timestamp cache, for example between managers over the
    /// same commit index. By default each manager gets its own.
    pub fn with_commit_timestamp_cache(mut self, cache: Arc<CommitTimestampCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn CommitValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_constraint_check(mut self, check: Arc<dyn ConstraintCheck>) -> Self {
        self.constraints.push(check);
        self
    }

    pub fn with_table(mut self, table: TableRef, metadata: TableMetadata) -> Self {
        self.tables.push((table, metadata));
        self
    }

    pub fn build(self) -> TransactionResult<SnapshotTransactionManager> {
        self.config.validate()?;
        let cache = self.cache.unwrap_or_else(|| {
            Arc::new(CommitTimestampCache::new(
                self.config.commit_timestamp_cache_capacity,
            ))
        });
        let statuses = CommitStatusResolver::new(
            self.commit_index.clone(),
            self.timelock.clone(),
            cache,
            self.config.lock_acquire_timeout,
        );
        let cleaner = GarbageCleaner::start(self.kvs.clone(), self.config.cleaner_queue_capacity)?;
        let tables = TableRegistry::new();
        for (table, metadata) in self.tables {
            tables.register(table, metadata);
        }
        Ok(SnapshotTransactionManager {
            context: Arc::new(EngineContext {
                kvs: self.kvs,
                timelock: self.timelock,
                commit_index: self.commit_index,
                sweep_queue: self.sweep_queue,
                statuses,
                cleaner,
                tables,
                validator: self.validator,
                constraints: self.constraints,
                config: self.config,
            }),
        })
    }
}

/// Hands out [`SnapshotTransaction`]s over a shared set of services.
pub struct SnapshotTransactionManager {
    context: Arc<EngineContext>,
}

impl TransactionManager for SnapshotTransactionManager {
    type Error = TransactionError;
    type Transaction = SnapshotTransaction;

    fn begin_transaction(&self) -> TransactionResult<Arc<SnapshotTransaction>> {
        self.begin_transaction_with_condition(Box::new(NoOpCondition))
    }

    fn immutable_timestamp(&self) -> TransactionResult<Timestamp> {
        self.context.timelock.immutable_timestamp()
    }
}

impl SnapshotTransactionManager {
    pub fn builder(
        kvs: Arc<dyn KeyValueService>,
        timelock: Arc<dyn TimelockService>,
        commit_index: Arc<dyn TransactionService>,
    ) -> TransactionManagerBuilder {
        TransactionManagerBuilder {
            kvs,
            timelock,
            commit_index,
            sweep_queue: Arc::new(NoOpSweepQueue),
            cache: None,
            validator: Arc::new(SnapshotIsolationValidator),
            constraints: Vec::new(),
            tables: Vec::new(),
            config: TransactionConfig::default(),
        }
    }

    /// Begin a transaction whose commit additionally requires `condition` to
    /// hold. The condition is cleaned up when the transaction finishes.
    pub fn begin_transaction_with_condition(
        &self,
        condition: Box<dyn PreCommitCondition>,
    ) -> TransactionResult<Arc<SnapshotTransaction>> {
        self.new_transaction(condition).map(Arc::new)
    }

    fn new_transaction(
        &self,
        condition: Box<dyn PreCommitCondition>,
    ) -> TransactionResult<SnapshotTransaction> {
        let timelock = &self.context.timelock;
        let immutable = match timelock.lock_immutable_timestamp() {
            Ok(immutable) => immutable,
            Err(err) => {
                condition.cleanup();
                return Err(err);
            }
        };
        let start_ts = match timelock.fresh_timestamp() {
            Ok(start_ts) => start_ts,
            Err(err) => {
                timelock.unlock(&[immutable.token]);
                condition.cleanup();
                return Err(err);
            }
        };
        debug!(%start_ts, immutable_ts = %immutable.immutable_ts, "transaction started");
        Ok(SnapshotTransaction::new(
            self.context.clone(),
            start_ts,
            immutable.immutable_ts,
            Some(immutable.token),
            condition,
        ))
    }

    /// Run `task` in a new transaction and commit it, starting over in a fresh
    /// transaction after retriable failures.
    pub fn run_task_with_retry<T, F>(&self, task: F) -> TransactionResult<T>
    where
        F: FnMut(&SnapshotTransaction) -> TransactionResult<T>,
    {
        self.run_task_with_condition_with_retry(
            || Ok(Box::new(NoOpCondition) as Box<dyn PreCommitCondition>),
            task,
        )
    }

    /// Like [`run_task_with_retry`](Self::run_task_with_retry), with a fresh
    /// pre-commit condition for every attempt.
    pub fn run_task_with_condition_with_retry<T, C, F>(
        &self,
        mut condition: C,
        mut task: F,
    ) -> TransactionResult<T>
    where
        C: FnMut() -> TransactionResult<Box<dyn PreCommitCondition>>,
        F: FnMut(&SnapshotTransaction) -> TransactionResult<T>,
    {
        let mut attempt = 0;
        loop {
            let outcome = condition().and_then(|condition| self.run_once(condition, &mut task));
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retriable() && attempt < self.context.config.max_retries => {
                    attempt += 1;
                    let delay = self.backoff(attempt);
                    info!(attempt, error = %err, ?delay, "retrying transaction");
                    thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn run_once<T, F>(
        &self,
        condition: Box<dyn PreCommitCondition>,
        task: &mut F,
    ) -> TransactionResult<T>
    where
        F: FnMut(&SnapshotTransaction) -> TransactionResult<T>,
    {
        let txn = self.new_transaction(condition)?;
        match task(&txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                // The task's error is what the caller needs to see.
                let _ = txn.abort();
                Err(err)
            }
        }
    }

    /// Run `task` once in a transaction that rejects writes.
    pub fn run_task_read_only<T, F>(&self, task: F) -> TransactionResult<T>
    where
        F: FnOnce(&SnapshotTransaction) -> TransactionResult<T>,
    {
        let mut txn = self.new_transaction(Box::new(NoOpCondition))?;
        txn.read_only = true;
        let value = task(&txn)?;
        txn.commit()?;
        Ok(value)
    }

    /// Run `task` with retries while holding the advisory locks named by
    /// `descriptors`. The locks are taken before every attempt, checked at
    /// commit and released when the attempt finishes.
    pub fn run_task_with_locks<T, F>(
        &self,
        descriptors: Vec<LockDescriptor>,
        task: F,
    ) -> TransactionResult<T>
    where
        F: FnMut(&SnapshotTransaction) -> TransactionResult<T>,
    {
        let timelock = self.context.timelock.clone();
        let timeout = self.context.config.lock_acquire_timeout;
        let acquire = || -> TransactionResult<Box<dyn PreCommitCondition>> {
            let request = LockRequest::new(timeout).with_descriptors(descriptors.iter().cloned());
            match timelock.lock(&request)? {
                Some(token) => Ok(Box::new(LockTokensCondition::new(
                    timelock.clone(),
                    vec![token],
                ))),
                None => Err(TransactionError::UserLockTimeout {
                    locks: request.len(),
                    timeout,
                }),
            }
        };
        self.run_task_with_condition_with_retry(acquire, task)
    }

    /// Exponential backoff with jitter.
    fn backoff(&self, attempt: usize) -> Duration {
        let base = self.context.config.retry_backoff;
        let exponent = attempt.saturating_sub(1).min(10) as u32;
        let jitter_micros = rand::rng().random_range(0..=base.as_micros() as u64);
        base.saturating_mul(1 << exponent) + Duration::from_micros(jitter_micros)
    }

    pub fn fresh_timestamp(&self) -> TransactionResult<Timestamp> {
        self.context.timelock.fresh_timestamp()
    }

    /// What the commit index currently records for `start_ts`, read directly
    /// from the index. Used to settle ambiguous commits.
    pub fn commit_status(&self, start_ts: Timestamp) -> TransactionResult<Option<CommitEntry>> {
        Ok(self.context.commit_index.get(start_ts)?)
    }

    pub fn register_table(&self, table: TableRef, metadata: TableMetadata) {
        self.context.tables.register(table, metadata);
    }

    pub fn table_metadata(&self, table: &TableRef) -> TableMetadata {
        self.context.tables.get(table)
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.context.config
    }

    pub fn commit_timestamp_cache(&self) -> &CommitTimestampCache {
        self.context.statuses.cache()
    }

    /// The background deleter of garbage versions.
    pub fn cleaner(&self) -> &GarbageCleaner {
        &self.context.cleaner
    }
}
