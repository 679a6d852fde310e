//! Hand-off of committed writes to background sweep.
//!
//! Writers announce every cell they are about to write before the values
//! reach the store, so that sweep can later find and clean the superseded
//! versions.

use parking_lot::Mutex;
use snapkv_common::{Cell, TableRef};

use crate::error::TransactionResult;
use crate::timestamp::Timestamp;

/// A single cell a transaction is about to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteInfo {
    pub table: TableRef,
    pub cell: Cell,
    pub start_ts: Timestamp,
    pub is_tombstone: bool,
}

pub trait SweepQueueWriter: Send + Sync {
    fn enqueue(&self, writes: &[WriteInfo]) -> TransactionResult<()>;
}

/// Discards every write; for deployments that do not sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpSweepQueue;

impl SweepQueueWriter for NoOpSweepQueue {
    fn enqueue(&self, _writes: &[WriteInfo]) -> TransactionResult<()> {
        Ok(())
    }
}

/// Keeps every enqueued write in memory.
#[derive(Default)]
pub struct InMemorySweepQueue {
    writes: Mutex<Vec<WriteInfo>>,
}

impl InMemorySweepQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything enqueued so far.
    pub fn drain(&self) -> Vec<WriteInfo> {
        std::mem::take(&mut *self.writes.lock())
    }

    pub fn len(&self) -> usize {
        self.writes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SweepQueueWriter for InMemorySweepQueue {
    fn enqueue(&self, writes: &[WriteInfo]) -> TransactionResult<()> {
        self.writes.lock().extend_from_slice(writes);
        Ok(())
    }
}
