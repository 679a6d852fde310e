//! Commit-time validation hooks.

use std::collections::BTreeMap;

use bytes::Bytes;
use snapkv_common::{Cell, TableRef};

use crate::error::TransactionResult;
use crate::timestamp::Timestamp;

/// Everything a validator may inspect about a commit in progress.
pub struct CommitContext<'a> {
    pub start_ts: Timestamp,
    pub commit_ts: Timestamp,
    /// Tables read or written by the transaction.
    pub involved_tables: &'a [TableRef],
    pub writes: &'a [(TableRef, BTreeMap<Cell, Bytes>)],
}

/// Extra checks run after the commit timestamp is known and before the outcome
/// is published. Stronger isolation levels plug in here.
pub trait CommitValidator: Send + Sync {
    fn validate(&self, context: &CommitContext<'_>) -> TransactionResult<()>;
}

/// Snapshot isolation needs nothing beyond write-write conflict detection.
#[derive(Debug, Default, Clone, Copy)]
pub struct SnapshotIsolationValidator;

impl CommitValidator for SnapshotIsolationValidator {
    fn validate(&self, _context: &CommitContext<'_>) -> TransactionResult<()> {
        Ok(())
    }
}

/// A table-level constraint evaluated against the writes of a transaction.
pub trait ConstraintCheck: Send + Sync {
    /// Human-readable violations; empty if the writes are acceptable.
    fn check(&self, table: &TableRef, writes: &BTreeMap<Cell, Bytes>) -> Vec<String>;
}
