//! Per-transaction buffer of uncommitted writes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;
use snapkv_common::{Cell, ColumnSelection, RangeRequest, TableRef};

/// Describes what a write changed, as seen by the writer.
///
/// Attached to cell locks so that other parties can learn what the lock
/// holder is doing to the cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeMetadata {
    Unchanged { current: Bytes },
    Updated { old: Bytes, new: Bytes },
    Deleted { old: Bytes },
    Created { new: Bytes },
}

#[derive(Default)]
struct TableWrites {
    values: SkipMap<Cell, Bytes>,
    metadata: SkipMap<Cell, ChangeMetadata>,
}

/// Uncommitted writes of one transaction, grouped by table.
///
/// An empty value is a delete. Writing a cell again replaces the buffered value.
#[derive(Default)]
pub struct LocalWriteBuffer {
    tables: DashMap<TableRef, Arc<TableWrites>>,
    byte_count: AtomicUsize,
}

impl LocalWriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, table: &TableRef) -> Option<Arc<TableWrites>> {
        self.tables.get(table).map(|writes| writes.value().clone())
    }

    fn table_or_create(&self, table: &TableRef) -> Arc<TableWrites> {
        self.tables.entry(table.clone()).or_default().value().clone()
    }

    pub fn put(&self, table: &TableRef, values: HashMap<Cell, Bytes>) {
        self.put_with_metadata(table, values, HashMap::new());
    }

    pub fn put_with_metadata(
        &self,
        table: &TableRef,
        values: HashMap<Cell, Bytes>,
        mut metadata: HashMap<Cell, ChangeMetadata>,
    ) {
        if values.is_empty() {
            return;
        }
        let writes = self.table_or_create(table);
        for (cell, value) in values {
            let size = cell.row().len() + cell.column().len() + value.len();
            self.byte_count.fetch_add(size, Ordering::Relaxed);
            match metadata.remove(&cell) {
                Some(change) => {
                    writes.metadata.insert(cell.clone(), change);
                }
                None => {
                    writes.metadata.remove(&cell);
                }
            }
            writes.values.insert(cell, value);
        }
    }

    /// The buffered value of a cell; an empty value is a buffered delete.
    pub fn get(&self, table: &TableRef, cell: &Cell) -> Option<Bytes> {
        self.table(table)?
            .values
            .get(cell)
            .map(|entry| entry.value().clone())
    }

    pub fn writes_for_table(&self, table: &TableRef) -> BTreeMap<Cell, Bytes> {
        self.table(table)
            .map(|writes| {
                writes
                    .values
                    .iter()
                    .map(|entry| (entry.key().clone(), entry.value().clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn metadata_for_table(&self, table: &TableRef) -> BTreeMap<Cell, ChangeMetadata> {
        self.table(table)
            .map(|writes| {
                writes
                    .metadata
                    .iter()
                    .map(|entry| (entry.key().clone(), entry.value().clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Buffered writes to the selected columns of the given rows.
    pub fn writes_for_rows(
        &self,
        table: &TableRef,
        rows: &[Bytes],
        columns: &ColumnSelection,
    ) -> BTreeMap<Cell, Bytes> {
        let Some(writes) = self.table(table) else {
            return BTreeMap::new();
        };
        let mut result = BTreeMap::new();
        for row in rows {
            let first = Cell::new(row.clone(), Bytes::new());
            for entry in writes.values.range(first..) {
                if entry.key().row() != row {
                    break;
                }
                if columns.contains(entry.key().column()) {
                    result.insert(entry.key().clone(), entry.value().clone());
                }
            }
        }
        result
    }

    /// Buffered writes whose rows lie in `[start_row, end_row)`, restricted to the
    /// request's columns. An empty `end_row` means unbounded.
    pub fn writes_in_rows(
        &self,
        table: &TableRef,
        request: &RangeRequest,
        start_row: &Bytes,
        end_row: Option<&Bytes>,
    ) -> BTreeMap<Cell, Bytes> {
        let Some(writes) = self.table(table) else {
            return BTreeMap::new();
        };
        let first = Cell::new(start_row.clone(), Bytes::new());
        writes
            .values
            .range(first..)
            .take_while(|entry| {
                let row = entry.key().row();
                request.contains_row(row) && end_row.is_none_or(|end| row < end)
            })
            .filter(|entry| request.columns().contains(entry.key().column()))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Tables with at least one buffered write, in name order.
    pub fn tables(&self) -> Vec<TableRef> {
        let mut tables: Vec<_> = self
            .tables
            .iter()
            .filter(|entry| !entry.value().values.is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        tables.sort();
        tables
    }

    pub fn is_empty(&self) -> bool {
        self.tables
            .iter()
            .all(|entry| entry.value().values.is_empty())
    }

    pub fn cell_count(&self) -> usize {
        self.tables
            .iter()
            .map(|entry| entry.value().values.len())
            .sum()
    }

    /// Bytes written so far, overwritten values included.
    pub fn byte_count(&self) -> usize {
        self.byte_count.load(Ordering::Relaxed)
    }
}
