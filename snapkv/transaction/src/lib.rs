//! Snapshot-isolation transactions over a versioned key-value store.
//!
//! The store itself is not transactional. Every transaction writes its values
//! at its start timestamp and commits by publishing a commit timestamp for it
//! in the commit index; readers decide visibility by looking writers up
//! there, rolling back writers that can no longer commit.

pub mod buffer;
pub mod cache;
pub mod cleaner;
mod commit;
pub mod commit_index;
pub mod condition;
pub mod config;
pub mod conflict;
mod context;
pub mod error;
pub mod lock;
pub mod manager;
mod resolver;
pub mod rollback;
pub mod scan;
pub mod sweep;
pub mod table;
pub mod timelock;
pub mod timestamp;
pub mod transaction;
pub mod validation;

pub use buffer::ChangeMetadata;
pub use cache::CommitTimestampCache;
pub use commit_index::{
    CommitEntry, CommitValue, InMemoryTransactionService, TransactionService,
    TransactionServiceError,
};
pub use condition::{LockTokensCondition, NoOpCondition, PreCommitCondition};
pub use config::{ConstraintCheckingMode, ReadSentinelBehavior, TransactionConfig};
pub use conflict::CellConflict;
pub use error::{ErrorKind, TimestampError, TransactionError, TransactionResult};
pub use lock::{LockDescriptor, LockRequest, LockToken};
pub use manager::{SnapshotTransactionManager, TransactionManager, TransactionManagerBuilder};
pub use sweep::{InMemorySweepQueue, NoOpSweepQueue, SweepQueueWriter, WriteInfo};
pub use table::{ConflictHandler, SweepStrategy, TableMetadata};
pub use timelock::{ImmutableTimestampLock, InMemoryTimelockService, TimelockService};
pub use timestamp::{Timestamp, TimestampGenerator};
pub use transaction::{SnapshotTransaction, Transaction, TransactionState};
pub use validation::{CommitContext, CommitValidator, ConstraintCheck, SnapshotIsolationValidator};
