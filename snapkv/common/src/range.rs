use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cell::Cell;

/// Which columns of a row a read should return.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ColumnSelection {
    #[default]
    All,
    Columns(BTreeSet<Bytes>),
}

impl ColumnSelection {
    pub fn create<I, C>(columns: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Bytes>,
    {
        Self::Columns(columns.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, column: &[u8]) -> bool {
        match self {
            ColumnSelection::All => true,
            ColumnSelection::Columns(columns) => columns.contains(column),
        }
    }
}

/// A scan over the rows `[start_row, end_row)`.
///
/// An empty `start_row` means "from the first row" and an empty `end_row` means
/// "until the last row".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeRequest {
    start_row: Bytes,
    end_row: Bytes,
    columns: ColumnSelection,
    batch_hint: usize,
}

impl RangeRequest {
    pub const DEFAULT_BATCH_HINT: usize = 100;

    pub fn new(start_row: impl Into<Bytes>, end_row: impl Into<Bytes>) -> Self {
        Self {
            start_row: start_row.into(),
            end_row: end_row.into(),
            columns: ColumnSelection::All,
            batch_hint: Self::DEFAULT_BATCH_HINT,
        }
    }

    /// A request covering the whole table.
    pub fn all() -> Self {
        Self::new(Bytes::new(), Bytes::new())
    }

    pub fn with_columns(self, columns: ColumnSelection) -> Self {
        Self { columns, ..self }
    }

    pub fn with_batch_hint(self, batch_hint: usize) -> Self {
        Self {
            batch_hint: batch_hint.max(1),
            ..self
        }
    }

    /// The same request, resumed from `start_row`.
    pub fn with_start_row(&self, start_row: Bytes) -> Self {
        Self {
            start_row,
            ..self.clone()
        }
    }

    pub fn start_row(&self) -> &Bytes {
        &self.start_row
    }

    pub fn end_row(&self) -> &Bytes {
        &self.end_row
    }

    pub fn columns(&self) -> &ColumnSelection {
        &self.columns
    }

    pub fn batch_hint(&self) -> usize {
        self.batch_hint
    }

    pub fn contains_row(&self, row: &[u8]) -> bool {
        row >= self.start_row.as_ref() && (self.end_row.is_empty() || row < self.end_row.as_ref())
    }

    pub fn contains_cell(&self, cell: &Cell) -> bool {
        self.contains_row(cell.row()) && self.columns.contains(cell.column())
    }
}

/// All selected columns of one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowResult<T> {
    row: Bytes,
    columns: BTreeMap<Bytes, T>,
}

impl<T> RowResult<T> {
    pub fn new(row: Bytes, columns: BTreeMap<Bytes, T>) -> Self {
        Self { row, columns }
    }

    pub fn row(&self) -> &Bytes {
        &self.row
    }

    pub fn columns(&self) -> &BTreeMap<Bytes, T> {
        &self.columns
    }

    pub fn into_columns(self) -> BTreeMap<Bytes, T> {
        self.columns
    }

    pub fn get(&self, column: &[u8]) -> Option<&T> {
        self.columns.get(column)
    }

    /// Iterate over `(cell, value)` pairs of this row.
    pub fn cells(&self) -> impl Iterator<Item = (Cell, &T)> + '_ {
        self.columns
            .iter()
            .map(|(column, value)| (Cell::new(self.row.clone(), column.clone()), value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_bounds() {
        let range = RangeRequest::new(&b"b"[..], &b"d"[..]);
        assert!(!range.contains_row(b"a"));
        assert!(range.contains_row(b"b"));
        assert!(range.contains_row(b"c"));
        assert!(!range.contains_row(b"d"));

        let all = RangeRequest::all();
        assert!(all.contains_row(b"a"));
        assert!(all.contains_row(b"zzzz"));
    }

    #[test]
    fn test_column_selection() {
        let selection = ColumnSelection::create([&b"x"[..], &b"y"[..]]);
        assert!(selection.contains(b"x"));
        assert!(!selection.contains(b"z"));
        assert!(ColumnSelection::All.contains(b"z"));

        let range = RangeRequest::all().with_columns(selection);
        assert!(range.contains_cell(&Cell::from_slices(b"r", b"y")));
        assert!(!range.contains_cell(&Cell::from_slices(b"r", b"z")));
    }

    #[test]
    fn test_batch_hint_is_positive() {
        assert_eq!(RangeRequest::all().with_batch_hint(0).batch_hint(), 1);
    }
}
