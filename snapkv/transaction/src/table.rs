//! Per-table transactional settings.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use snapkv_common::TableRef;

/// How commit-time conflicts on a table are detected and locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConflictHandler {
    /// No conflict checking and no write locks.
    IgnoreAll,
    /// Write-write conflicts, locking whole rows.
    #[default]
    RetryOnWriteWrite,
    /// Write-write conflicts, locking single cells.
    RetryOnWriteWriteCell,
    /// Like `RetryOnWriteWrite`, but a conflict where every party wrote the
    /// same value is ignored.
    RetryOnValueChanged,
}

/// Granularity of the locks taken at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGranularity {
    Row,
    Cell,
}

impl ConflictHandler {
    pub fn checks_write_write_conflicts(&self) -> bool {
        !matches!(self, ConflictHandler::IgnoreAll)
    }

    pub fn lock_granularity(&self) -> Option<LockGranularity> {
        match self {
            ConflictHandler::IgnoreAll => None,
            ConflictHandler::RetryOnWriteWrite | ConflictHandler::RetryOnValueChanged => {
                Some(LockGranularity::Row)
            }
            ConflictHandler::RetryOnWriteWriteCell => Some(LockGranularity::Cell),
        }
    }

    /// Whether conflicts that did not change the value are dropped.
    pub fn ignores_unchanged_values(&self) -> bool {
        matches!(self, ConflictHandler::RetryOnValueChanged)
    }
}

/// How background sweep treats a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SweepStrategy {
    /// Keeps the newest committed version below the sweep timestamp.
    #[default]
    Conservative,
    /// Removes every version below the sweep timestamp, including the newest
    /// one. Readers must hold a valid immutable timestamp lock.
    Thorough,
    Nothing,
}

impl SweepStrategy {
    /// Whether reads have to re-validate the immutable timestamp lock.
    pub fn requires_read_validation(&self) -> bool {
        matches!(self, SweepStrategy::Thorough)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableMetadata {
    pub conflict_handler: ConflictHandler,
    pub sweep_strategy: SweepStrategy,
}

impl TableMetadata {
    pub fn new(conflict_handler: ConflictHandler, sweep_strategy: SweepStrategy) -> Self {
        Self {
            conflict_handler,
            sweep_strategy,
        }
    }
}

/// Metadata of every known table. Unknown tables use the defaults.
#[derive(Default)]
pub struct TableRegistry {
    tables: DashMap<TableRef, TableMetadata>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, table: TableRef, metadata: TableMetadata) {
        self.tables.insert(table, metadata);
    }

    pub fn get(&self, table: &TableRef) -> TableMetadata {
        self.tables
            .get(table)
            .map(|metadata| *metadata)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let registry = TableRegistry::new();
        let metadata = registry.get(&TableRef::without_namespace("unknown"));
        assert_eq!(metadata.conflict_handler, ConflictHandler::RetryOnWriteWrite);
        assert_eq!(metadata.sweep_strategy, SweepStrategy::Conservative);
    }

    #[test]
    fn test_lock_granularity() {
        assert_eq!(ConflictHandler::IgnoreAll.lock_granularity(), None);
        assert_eq!(
            ConflictHandler::RetryOnValueChanged.lock_granularity(),
            Some(LockGranularity::Row)
        );
        assert_eq!(
            ConflictHandler::RetryOnWriteWriteCell.lock_granularity(),
            Some(LockGranularity::Cell)
        );
    }

    #[test]
    fn test_registered_metadata_wins() {
        let registry = TableRegistry::new();
        let table = TableRef::new("ns", "t");
        registry.register(
            table.clone(),
            TableMetadata::new(ConflictHandler::IgnoreAll, SweepStrategy::Thorough),
        );
        assert!(registry.get(&table).sweep_strategy.requires_read_validation());
    }
}
