//! Snapshot transactions.
//!
//! A transaction reads the newest versions committed before its start
//! timestamp, buffers its writes locally and publishes them atomically at
//! commit. See [`crate::commit`] for the commit protocol.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use dashmap::DashSet;
use snapkv_common::{Cell, ColumnSelection, RangeRequest, RowResult, TableRef};
use tracing::{debug, trace};

use crate::buffer::{ChangeMetadata, LocalWriteBuffer};
use crate::condition::PreCommitCondition;
use crate::config::ReadSentinelBehavior;
use crate::context::EngineContext;
use crate::error::{TransactionError, TransactionResult};
use crate::lock::LockToken;
use crate::resolver::ReadResolver;
use crate::scan::RangeScan;
use crate::timestamp::Timestamp;

/// Trait defining the core operations that all transactions must support.
pub trait Transaction: Send + Sync {
    /// The error type for transaction operations
    type Error;

    /// Get the start timestamp of the transaction
    fn start_ts(&self) -> Timestamp;

    /// Get the commit timestamp of the transaction, once it published one
    fn commit_ts(&self) -> Option<Timestamp>;

    fn state(&self) -> TransactionState;

    /// Commit the transaction, returning the commit timestamp on success
    fn commit(&self) -> Result<Timestamp, Self::Error>;

    /// Abort the transaction and discard all buffered changes
    fn abort(&self) -> Result<(), Self::Error>;
}

/// Lifecycle of a transaction.
///
/// `Uncommitted` moves to `Committing` when commit starts, then to exactly one
/// of `Committed` or `Failed`. `Uncommitted` may also move to `Aborted`. The
/// last three states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransactionState {
    Uncommitted = 0,
    Committing = 1,
    Committed = 2,
    Failed = 3,
    Aborted = 4,
}

impl TransactionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TransactionState::Uncommitted,
            1 => TransactionState::Committing,
            2 => TransactionState::Committed,
            3 => TransactionState::Failed,
            _ => TransactionState::Aborted,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Failed | TransactionState::Aborted
        )
    }
}

/// Counts an in-flight write for as long as it lives.
pub(crate) struct WriterGuard<'a>(&'a AtomicUsize);

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SnapshotTransaction {
    pub(crate) context: Arc<EngineContext>,

    // ---- Timestamp management ----
    pub(crate) start_ts: Timestamp,
    pub(crate) immutable_ts: Timestamp,
    pub(crate) immutable_lock: Option<LockToken>,
    pub(crate) commit_ts: OnceLock<Timestamp>,

    // ---- Transaction config ----
    pub(crate) condition: Box<dyn PreCommitCondition>,
    pub(crate) sentinel_behavior: ReadSentinelBehavior,
    /// Writes are rejected.
    pub(crate) read_only: bool,

    // ---- Reads and writes ----
    pub(crate) buffer: LocalWriteBuffer,
    pub(crate) involved_tables: DashSet<TableRef>,

    // ---- Transaction state tracking ----
    state: AtomicU8,
    active_writers: AtomicUsize,
    /// Set once the immutable timestamp lock and the condition are released.
    finished: AtomicBool,
}

impl Transaction for SnapshotTransaction {
    type Error = TransactionError;

    fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    fn commit_ts(&self) -> Option<Timestamp> {
        self.commit_ts.get().copied()
    }

    fn state(&self) -> TransactionState {
        TransactionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn commit(&self) -> TransactionResult<Timestamp> {
        self.commit_internal()
    }

    fn abort(&self) -> TransactionResult<()> {
        match self.transition(TransactionState::Uncommitted, TransactionState::Aborted) {
            Ok(()) => {
                debug!(start_ts = %self.start_ts, "transaction aborted");
                self.finish();
                Ok(())
            }
            Err(TransactionState::Aborted | TransactionState::Failed) => Ok(()),
            Err(state) => Err(TransactionError::TransactionClosed {
                start_ts: self.start_ts,
                state,
            }),
        }
    }
}

impl SnapshotTransaction {
    pub(crate) fn new(
        context: Arc<EngineContext>,
        start_ts: Timestamp,
        immutable_ts: Timestamp,
        immutable_lock: Option<LockToken>,
        condition: Box<dyn PreCommitCondition>,
    ) -> Self {
        let sentinel_behavior = context.config.read_sentinel_behavior;
        Self {
            context,
            start_ts,
            immutable_ts,
            immutable_lock,
            commit_ts: OnceLock::new(),
            condition,
            sentinel_behavior,
            read_only: false,
            buffer: LocalWriteBuffer::new(),
            involved_tables: DashSet::new(),
            state: AtomicU8::new(TransactionState::Uncommitted as u8),
            active_writers: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
        }
    }

    /// The immutable timestamp locked when the transaction began.
    pub fn immutable_ts(&self) -> Timestamp {
        self.immutable_ts
    }

    /// The token of the immutable timestamp lock held until the transaction
    /// finishes.
    pub fn immutable_timestamp_lock(&self) -> Option<LockToken> {
        self.immutable_lock
    }

    /// Number of cells written so far.
    pub fn write_count(&self) -> usize {
        self.buffer.cell_count()
    }

    /// Bytes written so far, overwrites included.
    pub fn byte_count(&self) -> usize {
        self.buffer.byte_count()
    }

    // ---- Reads ----

    /// Values of the given cells as seen by this transaction. Cells without a
    /// visible value, or deleted ones, are absent.
    pub fn get(&self, table: &TableRef, cells: &[Cell]) -> TransactionResult<HashMap<Cell, Bytes>> {
        self.ensure_uncommitted()?;
        self.involved_tables.insert(table.clone());

        let mut result = HashMap::with_capacity(cells.len());
        let mut remote = HashMap::new();
        for cell in cells {
            match self.buffer.get(table, cell) {
                Some(local) => {
                    if !local.is_empty() {
                        result.insert(cell.clone(), local);
                    }
                }
                None => {
                    remote.insert(cell.clone(), self.start_ts);
                }
            }
        }
        if !remote.is_empty() {
            let raw = self.context.kvs.get(table, &remote)?;
            self.validate_read(table)?;
            result.extend(self.resolver(table).resolve(raw)?);
        }
        trace!(start_ts = %self.start_ts, %table, requested = cells.len(), found = result.len(), "get");
        Ok(result)
    }

    /// Single-cell convenience over [`get`](Self::get).
    pub fn get_cell(&self, table: &TableRef, cell: &Cell) -> TransactionResult<Option<Bytes>> {
        Ok(self.get(table, std::slice::from_ref(cell))?.remove(cell))
    }

    /// The selected columns of the given rows, in row order. Rows without any
    /// visible column are omitted.
    pub fn get_rows(
        &self,
        table: &TableRef,
        rows: &[Bytes],
        columns: &ColumnSelection,
    ) -> TransactionResult<Vec<RowResult<Bytes>>> {
        self.ensure_uncommitted()?;
        self.involved_tables.insert(table.clone());

        let raw = self
            .context
            .kvs
            .get_rows(table, rows, columns, self.start_ts)?;
        self.validate_read(table)?;
        let remote = self.resolver(table).resolve(raw)?;
        let local = self.buffer.writes_for_rows(table, rows, columns);
        Ok(merge_rows(remote, local))
    }

    /// Lazily scan a row range. Pages are fetched as the iterator advances.
    pub fn get_range(
        &self,
        table: &TableRef,
        request: RangeRequest,
    ) -> TransactionResult<RangeScan<'_>> {
        self.ensure_uncommitted()?;
        self.involved_tables.insert(table.clone());
        Ok(RangeScan::new(self, table.clone(), request))
    }

    /// What our snapshot sees, without our own writes.
    pub(crate) fn get_ignoring_local_writes(
        &self,
        table: &TableRef,
        cells: &[Cell],
    ) -> TransactionResult<HashMap<Cell, Bytes>> {
        if cells.is_empty() {
            return Ok(HashMap::new());
        }
        let request: HashMap<Cell, Timestamp> = cells
            .iter()
            .map(|cell| (cell.clone(), self.start_ts))
            .collect();
        let raw = self.context.kvs.get(table, &request)?;
        self.resolver(table).resolve(raw)
    }

    pub(crate) fn resolver<'a>(&'a self, table: &'a TableRef) -> ReadResolver<'a> {
        ReadResolver::new(&self.context, table, self.start_ts, self.sentinel_behavior)
    }

    /// Reads of thoroughly swept tables are only safe while our immutable
    /// timestamp lock is held.
    pub(crate) fn validate_read(&self, table: &TableRef) -> TransactionResult<()> {
        if !self.context.config.validate_locks_on_reads {
            return Ok(());
        }
        if !self
            .context
            .tables
            .get(table)
            .sweep_strategy
            .requires_read_validation()
        {
            return Ok(());
        }
        self.validate_immutable_lock()
    }

    pub(crate) fn validate_immutable_lock(&self) -> TransactionResult<()> {
        let Some(token) = self.immutable_lock else {
            return Ok(());
        };
        if self.context.timelock.refresh_lock_leases(&[token])?.contains(&token) {
            Ok(())
        } else {
            Err(TransactionError::ImmutableTimestampLockExpired {
                start_ts: self.start_ts,
            })
        }
    }

    // ---- Writes ----

    /// Buffer writes. Values must be non-empty; use [`delete`](Self::delete)
    /// to remove cells.
    pub fn put(&self, table: &TableRef, values: HashMap<Cell, Bytes>) -> TransactionResult<()> {
        self.put_with_metadata(table, values, HashMap::new())
    }

    /// Buffer writes together with a description of what they change. The
    /// metadata is attached to the cell locks taken at commit.
    pub fn put_with_metadata(
        &self,
        table: &TableRef,
        values: HashMap<Cell, Bytes>,
        metadata: HashMap<Cell, ChangeMetadata>,
    ) -> TransactionResult<()> {
        if let Some(cell) = values
            .iter()
            .find_map(|(cell, value)| value.is_empty().then_some(cell))
        {
            return Err(TransactionError::InvalidArgument(format!(
                "empty value for {cell}; deletes go through delete()"
            )));
        }
        if let Some(cell) = metadata.keys().find(|cell| !values.contains_key(*cell)) {
            return Err(TransactionError::InvalidArgument(format!(
                "change metadata for {cell} which is not written"
            )));
        }
        self.buffer_writes(table, values, metadata)
    }

    /// Buffer a delete of every cell.
    pub fn delete(&self, table: &TableRef, cells: &[Cell]) -> TransactionResult<()> {
        let tombstones = cells
            .iter()
            .map(|cell| (cell.clone(), Bytes::new()))
            .collect();
        self.buffer_writes(table, tombstones, HashMap::new())
    }

    fn buffer_writes(
        &self,
        table: &TableRef,
        values: HashMap<Cell, Bytes>,
        metadata: HashMap<Cell, ChangeMetadata>,
    ) -> TransactionResult<()> {
        let _writer = self.enter_write()?;
        if let Some(cell) = values.keys().find(|cell| !cell.is_valid()) {
            return Err(TransactionError::InvalidArgument(format!(
                "row and column names must be non-empty: {cell}"
            )));
        }
        self.involved_tables.insert(table.clone());
        self.buffer.put_with_metadata(table, values, metadata);
        Ok(())
    }

    fn enter_write(&self) -> TransactionResult<WriterGuard<'_>> {
        self.active_writers.fetch_add(1, Ordering::SeqCst);
        let guard = WriterGuard(&self.active_writers);
        self.ensure_uncommitted()?;
        if self.read_only {
            return Err(TransactionError::InvalidArgument(format!(
                "transaction {} is read-only",
                self.start_ts
            )));
        }
        Ok(guard)
    }

    pub(crate) fn active_writers(&self) -> usize {
        self.active_writers.load(Ordering::SeqCst)
    }

    // ---- State ----

    pub(crate) fn ensure_uncommitted(&self) -> TransactionResult<()> {
        match self.state() {
            TransactionState::Uncommitted => Ok(()),
            state => Err(TransactionError::TransactionClosed {
                start_ts: self.start_ts,
                state,
            }),
        }
    }

    /// Move from `from` to `to`, or report the state that prevented it.
    pub(crate) fn transition(
        &self,
        from: TransactionState,
        to: TransactionState,
    ) -> Result<(), TransactionState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(TransactionState::from_u8)
    }

    pub(crate) fn set_state(&self, state: TransactionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Release everything held for the lifetime of the transaction. Runs once.
    pub(crate) fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(token) = self.immutable_lock {
            self.context.timelock.unlock(&[token]);
        }
        self.condition.cleanup();
    }
}

impl Drop for SnapshotTransaction {
    fn drop(&mut self) {
        if self.state() == TransactionState::Uncommitted {
            let _ = self.abort();
        }
        self.finish();
    }
}

/// Overlay local writes on resolved remote values and group them by row.
pub(crate) fn merge_rows(
    remote: HashMap<Cell, Bytes>,
    local: BTreeMap<Cell, Bytes>,
) -> Vec<RowResult<Bytes>> {
    let mut cells: BTreeMap<Cell, Bytes> = remote.into_iter().collect();
    for (cell, value) in local {
        if value.is_empty() {
            cells.remove(&cell);
        } else {
            cells.insert(cell, value);
        }
    }
    let mut rows: BTreeMap<Bytes, BTreeMap<Bytes, Bytes>> = BTreeMap::new();
    for (cell, value) in cells {
        rows.entry(cell.row().clone())
            .or_default()
            .insert(cell.column().clone(), value);
    }
    rows.into_iter()
        .map(|(row, columns)| RowResult::new(row, columns))
        .collect()
}

#[cfg(test)]
mod tests {
    use snapkv_storage::InMemoryKeyValueService;

    use super::*;
    use crate::commit_index::InMemoryTransactionService;
    use crate::error::ErrorKind;
    use crate::manager::{SnapshotTransactionManager, TransactionManager};
    use crate::timelock::InMemoryTimelockService;

    fn manager() -> SnapshotTransactionManager {
        SnapshotTransactionManager::builder(
            Arc::new(InMemoryKeyValueService::new()),
            Arc::new(InMemoryTimelockService::new()),
            Arc::new(InMemoryTransactionService::new()),
        )
        .build()
        .unwrap()
    }

    #[test]
    fn test_commit_rejected_while_write_in_flight() {
        let manager = manager();
        let table = TableRef::new("test", "writers");
        let cell = Cell::from_slices(b"r", b"c");
        let txn = manager.begin_transaction().unwrap();
        txn.put(&table, HashMap::from([(cell.clone(), Bytes::from_static(b"v"))]))
            .unwrap();

        let writer = txn.enter_write().unwrap();
        assert_eq!(txn.active_writers(), 1);
        let err = txn.commit().unwrap_err();
        assert!(
            matches!(err, TransactionError::ConcurrentWriteDuringCommit { writers: 1, .. }),
            "unexpected error {err:?}"
        );
        assert_eq!(err.kind(), ErrorKind::Invalid);
        assert_eq!(txn.state(), TransactionState::Failed);

        drop(writer);
        assert_eq!(txn.active_writers(), 0);
        assert!(txn.put(&table, HashMap::from([(cell, Bytes::from_static(b"w"))])).is_err());
    }
}
