use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;
use snapkv_common::{Cell, ColumnSelection, RangeRequest, RowResult, TableRef, Timestamp, Value};
use tracing::trace;

use crate::error::{StorageError, StorageResult};
use crate::kvs::{KeyValueService, RangePage};

/// Key of one stored version. Versions of a cell are adjacent and ascend by
/// timestamp.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct VersionKey {
    cell: Cell,
    timestamp: Timestamp,
}

impl VersionKey {
    fn new(cell: Cell, timestamp: Timestamp) -> Self {
        Self { cell, timestamp }
    }
}

type VersionMap = SkipMap<VersionKey, Bytes>;

/// A versioned cell store kept entirely in memory.
#[derive(Default)]
pub struct InMemoryKeyValueService {
    tables: DashMap<TableRef, Arc<VersionMap>>,
}

impl InMemoryKeyValueService {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, table: &TableRef) -> Option<Arc<VersionMap>> {
        self.tables.get(table).map(|entry| entry.value().clone())
    }

    fn table_or_create(&self, table: &TableRef) -> Arc<VersionMap> {
        self.tables.entry(table.clone()).or_default().value().clone()
    }

    /// Newest version of `cell` strictly below `timestamp`.
    fn latest_below(versions: &VersionMap, cell: &Cell, timestamp: Timestamp) -> Option<Value> {
        if timestamp.is_sweep_sentinel() {
            return None;
        }
        let lower = VersionKey::new(cell.clone(), Timestamp::SWEEP_SENTINEL);
        let upper = VersionKey::new(cell.clone(), timestamp);
        versions
            .range(lower..upper)
            .next_back()
            .map(|entry| Value::new(entry.value().clone(), entry.key().timestamp))
    }

    /// Every cell of `row`, in column order.
    fn cells_of_row(versions: &VersionMap, row: &Bytes) -> Vec<Cell> {
        let lower = VersionKey::new(Cell::new(row.clone(), Bytes::new()), Timestamp::SWEEP_SENTINEL);
        let mut cells: Vec<Cell> = Vec::new();
        for entry in versions.range(lower..) {
            let cell = &entry.key().cell;
            if cell.row() != row {
                break;
            }
            if cells.last() != Some(cell) {
                cells.push(cell.clone());
            }
        }
        cells
    }
}

impl KeyValueService for InMemoryKeyValueService {
    fn get(
        &self,
        table: &TableRef,
        timestamp_by_cell: &HashMap<Cell, Timestamp>,
    ) -> StorageResult<HashMap<Cell, Value>> {
        let Some(versions) = self.table(table) else {
            return Ok(HashMap::new());
        };
        Ok(timestamp_by_cell
            .iter()
            .filter_map(|(cell, ts)| {
                Self::latest_below(&versions, cell, *ts).map(|value| (cell.clone(), value))
            })
            .collect())
    }

    fn get_rows(
        &self,
        table: &TableRef,
        rows: &[Bytes],
        columns: &ColumnSelection,
        timestamp: Timestamp,
    ) -> StorageResult<HashMap<Cell, Value>> {
        let Some(versions) = self.table(table) else {
            return Ok(HashMap::new());
        };
        let mut result = HashMap::new();
        for row in rows {
            for cell in Self::cells_of_row(&versions, row) {
                if !columns.contains(cell.column()) {
                    continue;
                }
                if let Some(value) = Self::latest_below(&versions, &cell, timestamp) {
                    result.insert(cell, value);
                }
            }
        }
        Ok(result)
    }

    fn get_range(
        &self,
        table: &TableRef,
        request: &RangeRequest,
        timestamp: Timestamp,
    ) -> StorageResult<RangePage> {
        let mut page = RangePage::default();
        let Some(versions) = self.table(table) else {
            return Ok(page);
        };

        let lower = VersionKey::new(
            Cell::new(request.start_row().clone(), Bytes::new()),
            Timestamp::SWEEP_SENTINEL,
        );
        let mut current: Option<(Bytes, BTreeMap<Bytes, Value>)> = None;
        for entry in versions.range(lower..) {
            let key = entry.key();
            let row = key.cell.row();
            if !request.contains_row(row) {
                break;
            }
            let same_row = current.as_ref().is_some_and(|(current_row, _)| current_row == row);
            if !same_row {
                if let Some((finished_row, columns)) = current.take() {
                    if !columns.is_empty() {
                        page.rows.push(RowResult::new(finished_row, columns));
                    }
                }
                if page.rows.len() >= request.batch_hint() {
                    page.next_start_row = Some(row.clone());
                    return Ok(page);
                }
                current = Some((row.clone(), BTreeMap::new()));
            }
            if key.timestamp >= timestamp || !request.columns().contains(key.cell.column()) {
                continue;
            }
            if let Some((_, columns)) = current.as_mut() {
                // Versions ascend by timestamp, so the last one inserted wins.
                columns.insert(
                    key.cell.column().clone(),
                    Value::new(entry.value().clone(), key.timestamp),
                );
            }
        }
        if let Some((finished_row, columns)) = current.take() {
            if !columns.is_empty() {
                page.rows.push(RowResult::new(finished_row, columns));
            }
        }
        Ok(page)
    }

    fn multi_put(
        &self,
        table: &TableRef,
        values: &HashMap<Cell, Bytes>,
        timestamp: Timestamp,
    ) -> StorageResult<()> {
        let versions = self.table_or_create(table);
        for (cell, contents) in values {
            let key = VersionKey::new(cell.clone(), timestamp);
            let entry = versions.get_or_insert(key, contents.clone());
            if entry.value() != contents {
                return Err(StorageError::KeyAlreadyExists {
                    table: table.clone(),
                    cell: cell.clone(),
                    timestamp,
                });
            }
        }
        trace!(%table, %timestamp, cells = values.len(), "multi put");
        Ok(())
    }

    fn delete(
        &self,
        table: &TableRef,
        versions: &HashMap<Cell, Vec<Timestamp>>,
    ) -> StorageResult<()> {
        let Some(stored) = self.table(table) else {
            return Ok(());
        };
        for (cell, timestamps) in versions {
            for timestamp in timestamps {
                stored.remove(&VersionKey::new(cell.clone(), *timestamp));
            }
        }
        Ok(())
    }

    fn get_latest_timestamps(
        &self,
        table: &TableRef,
        timestamp_by_cell: &HashMap<Cell, Timestamp>,
    ) -> StorageResult<HashMap<Cell, Timestamp>> {
        Ok(self
            .get(table, timestamp_by_cell)?
            .into_iter()
            .map(|(cell, value)| (cell, value.timestamp()))
            .collect())
    }

    fn get_all_timestamps(
        &self,
        table: &TableRef,
        cells: &[Cell],
        timestamp: Timestamp,
    ) -> StorageResult<HashMap<Cell, Vec<Timestamp>>> {
        let Some(versions) = self.table(table) else {
            return Ok(HashMap::new());
        };
        let mut result = HashMap::new();
        for cell in cells {
            if timestamp.is_sweep_sentinel() {
                break;
            }
            let lower = VersionKey::new(cell.clone(), Timestamp::SWEEP_SENTINEL);
            let upper = VersionKey::new(cell.clone(), timestamp);
            let timestamps: Vec<Timestamp> = versions
                .range(lower..upper)
                .map(|entry| entry.key().timestamp)
                .collect();
            if !timestamps.is_empty() {
                result.insert(cell.clone(), timestamps);
            }
        }
        Ok(result)
    }

    fn add_sweep_sentinels(&self, table: &TableRef, cells: &[Cell]) -> StorageResult<()> {
        let versions = self.table_or_create(table);
        for cell in cells {
            versions.get_or_insert(
                VersionKey::new(cell.clone(), Timestamp::SWEEP_SENTINEL),
                Bytes::new(),
            );
        }
        Ok(())
    }
}
