//! The contract of the versioned cell store.
//!
//! The store keeps every version of every cell, keyed by `(table, row, column,
//! timestamp)`, and never overwrites one. It knows nothing about transactions:
//! deciding which of those versions is committed is the job of the transaction
//! layer.

use std::collections::HashMap;

use bytes::Bytes;
use snapkv_common::{Cell, ColumnSelection, RangeRequest, RowResult, TableRef, Timestamp, Value};

use crate::error::StorageResult;

/// One page of a range scan.
#[derive(Debug, Clone, Default)]
pub struct RangePage {
    /// Rows in ascending order, each holding the newest version of its selected
    /// columns below the read timestamp.
    pub rows: Vec<RowResult<Value>>,
    /// Where the next page starts, or `None` if the range is exhausted.
    pub next_start_row: Option<Bytes>,
}

/// Trait defining the versioned key-value store consumed by transactions.
///
/// All read bounds are exclusive: a read "at" timestamp `ts` only sees
/// versions written with a timestamp strictly smaller than `ts`.
pub trait KeyValueService: Send + Sync {
    /// For every cell, the newest version strictly below the associated timestamp.
    /// Cells without such a version are absent from the result.
    fn get(
        &self,
        table: &TableRef,
        timestamp_by_cell: &HashMap<Cell, Timestamp>,
    ) -> StorageResult<HashMap<Cell, Value>>;

    /// The newest versions below `timestamp` of the selected columns of `rows`.
    fn get_rows(
        &self,
        table: &TableRef,
        rows: &[Bytes],
        columns: &ColumnSelection,
        timestamp: Timestamp,
    ) -> StorageResult<HashMap<Cell, Value>>;

    /// One page of the newest versions below `timestamp` in the requested range.
    /// At most `request.batch_hint()` rows are returned.
    fn get_range(
        &self,
        table: &TableRef,
        request: &RangeRequest,
        timestamp: Timestamp,
    ) -> StorageResult<RangePage>;

    /// Write every value at the same timestamp.
    ///
    /// Writing the same contents twice is allowed. Writing different contents at an
    /// existing version fails with `KeyAlreadyExists`.
    fn multi_put(
        &self,
        table: &TableRef,
        values: &HashMap<Cell, Bytes>,
        timestamp: Timestamp,
    ) -> StorageResult<()>;

    /// Remove specific versions. Missing versions are ignored.
    fn delete(
        &self,
        table: &TableRef,
        versions: &HashMap<Cell, Vec<Timestamp>>,
    ) -> StorageResult<()>;

    /// For every cell, the timestamp of its newest version strictly below the
    /// associated timestamp.
    fn get_latest_timestamps(
        &self,
        table: &TableRef,
        timestamp_by_cell: &HashMap<Cell, Timestamp>,
    ) -> StorageResult<HashMap<Cell, Timestamp>>;

    /// Every version timestamp strictly below `timestamp`, ascending.
    fn get_all_timestamps(
        &self,
        table: &TableRef,
        cells: &[Cell],
        timestamp: Timestamp,
    ) -> StorageResult<HashMap<Cell, Vec<Timestamp>>>;

    /// Write sweep sentinels for the cells. Existing sentinels are left untouched.
    fn add_sweep_sentinels(&self, table: &TableRef, cells: &[Cell]) -> StorageResult<()>;
}
