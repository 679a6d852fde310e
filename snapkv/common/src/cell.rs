use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::timestamp::Timestamp;

/// Fully qualified table name, `namespace.table` or just `table`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableRef(Arc<str>);

impl TableRef {
    /// Create a reference to a table living in a namespace.
    pub fn new(namespace: &str, table: &str) -> Self {
        Self(format!("{namespace}.{table}").into())
    }

    /// Create a reference to a table without namespace.
    pub fn without_namespace(table: &str) -> Self {
        Self(table.into())
    }

    /// Returns the qualified name of the table.
    pub fn qualified_name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The address of a value inside a table.
///
/// Cells order lexicographically by row, then by column.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cell {
    row: Bytes,
    column: Bytes,
}

impl Cell {
    pub fn new(row: impl Into<Bytes>, column: impl Into<Bytes>) -> Self {
        Self {
            row: row.into(),
            column: column.into(),
        }
    }

    /// Convenience constructor copying borrowed slices.
    pub fn from_slices(row: &[u8], column: &[u8]) -> Self {
        Self::new(Bytes::copy_from_slice(row), Bytes::copy_from_slice(column))
    }

    pub fn row(&self) -> &Bytes {
        &self.row
    }

    pub fn column(&self) -> &Bytes {
        &self.column
    }

    /// Both the row and the column name must be non-empty.
    pub fn is_valid(&self) -> bool {
        !self.row.is_empty() && !self.column.is_empty()
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {})",
            String::from_utf8_lossy(&self.row),
            String::from_utf8_lossy(&self.column)
        )
    }
}

/// A single stored version of a cell.
///
/// Empty contents mark a delete (tombstone).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    contents: Bytes,
    timestamp: Timestamp,
}

impl Value {
    pub fn new(contents: impl Into<Bytes>, timestamp: Timestamp) -> Self {
        Self {
            contents: contents.into(),
            timestamp,
        }
    }

    /// The placeholder version written by sweep after it removed older versions.
    pub fn sweep_sentinel() -> Self {
        Self::new(Bytes::new(), Timestamp::SWEEP_SENTINEL)
    }

    pub fn contents(&self) -> &Bytes {
        &self.contents
    }

    pub fn into_contents(self) -> Bytes {
        self.contents
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn is_tombstone(&self) -> bool {
        self.contents.is_empty()
    }

    pub fn is_sweep_sentinel(&self) -> bool {
        self.timestamp.is_sweep_sentinel()
    }
}
