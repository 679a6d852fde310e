use std::fmt;
use std::time::Duration;

use snapkv_common::{Cell, TableRef, Timestamp};
use snapkv_storage::StorageError;
use thiserror::Error;

use crate::commit_index::{CommitValue, TransactionServiceError};
use crate::conflict::CellConflict;
use crate::transaction::TransactionState;

pub type TransactionResult<T> = Result<T, TransactionError>;

/// Coarse classification of a [`TransactionError`].
///
/// Callers decide whether to retry from the kind alone; the variants of
/// [`TransactionError`] carry the diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Another transaction committed a write to one of our cells.
    Conflict,
    /// A lock could not be acquired in time.
    LockTimeout,
    /// A lock we relied on was lost, or a read hit a swept cell.
    LockExpired,
    /// A user-supplied pre-commit condition rejected the commit.
    PreCommitCondition,
    /// The commit may or may not have been published.
    AmbiguousCommit,
    /// The transaction was rolled back by somebody else.
    Failed,
    /// An invariant of the protocol was violated.
    Fatal,
    /// A table constraint rejected the writes.
    Constraint,
    /// The operation is not allowed in the current state.
    Invalid,
    /// A collaborating service could not be reached.
    Unavailable,
}

impl ErrorKind {
    /// Whether a fresh transaction running the same task may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Conflict
                | ErrorKind::LockTimeout
                | ErrorKind::LockExpired
                | ErrorKind::Unavailable
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Conflict => "conflict",
            ErrorKind::LockTimeout => "lock timeout",
            ErrorKind::LockExpired => "lock expired",
            ErrorKind::PreCommitCondition => "pre-commit condition",
            ErrorKind::AmbiguousCommit => "ambiguous commit",
            ErrorKind::Failed => "failed",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Constraint => "constraint",
            ErrorKind::Invalid => "invalid",
            ErrorKind::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error(
        "Write-write conflict for transaction {start_ts} on table {table}: {} spanning, {} dominating",
        spanning.len(),
        dominating.len()
    )]
    WriteWriteConflict {
        table: TableRef,
        start_ts: Timestamp,
        spanning: Vec<CellConflict>,
        dominating: Vec<CellConflict>,
    },

    #[error("Timed out after {timeout:?} acquiring {locks} locks for transaction {start_ts}")]
    LockTimeout {
        start_ts: Timestamp,
        locks: usize,
        timeout: Duration,
    },

    #[error("Timed out after {timeout:?} acquiring {locks} user locks")]
    UserLockTimeout { locks: usize, timeout: Duration },

    #[error("Commit locks of transaction {start_ts} expired")]
    CommitLocksExpired { start_ts: Timestamp },

    #[error("Immutable timestamp lock of transaction {start_ts} expired")]
    ImmutableTimestampLockExpired { start_ts: Timestamp },

    #[error("Transaction {start_ts} read cell {cell} of table {table} after it was swept")]
    SweptValueRead {
        table: TableRef,
        cell: Cell,
        start_ts: Timestamp,
    },

    #[error("Pre-commit condition failed: {message}")]
    PreCommitConditionFailed { message: String, retriable: bool },

    #[error("Outcome of transaction {start_ts} committing at {commit_ts} is unknown: {reason}")]
    AmbiguousCommit {
        start_ts: Timestamp,
        commit_ts: Timestamp,
        reason: String,
    },

    #[error("Transaction {start_ts} was rolled back by a concurrent reader")]
    RolledBackByOther { start_ts: Timestamp },

    #[error("Transaction {start_ts} was already decided as {existing:?}")]
    AlreadyDecided {
        start_ts: Timestamp,
        existing: CommitValue,
    },

    #[error("Timestamp {start_ts} was reused by another writer of cell {cell} in table {table}")]
    TimestampReuse {
        table: TableRef,
        cell: Cell,
        start_ts: Timestamp,
    },

    #[error(
        "Conflicting version {their_start_ts} of cell {cell} in table {table} vanished while locked"
    )]
    MissingConflictingValue {
        table: TableRef,
        cell: Cell,
        their_start_ts: Timestamp,
    },

    #[error(
        "Gave up resolving versions of table {table} after {iterations} iterations (sample: {sample:?})"
    )]
    PostFilterExhausted {
        table: TableRef,
        iterations: usize,
        sample: Vec<Cell>,
    },

    #[error("Commit timestamp {commit_ts} is not above start timestamp {start_ts}")]
    NonMonotonicCommitTimestamp {
        start_ts: Timestamp,
        commit_ts: Timestamp,
    },

    #[error("Constraint violation on table {table}: {violations:?}")]
    ConstraintViolation {
        table: TableRef,
        violations: Vec<String>,
    },

    #[error("Transaction {start_ts} is {state:?}")]
    TransactionClosed {
        start_ts: Timestamp,
        state: TransactionState,
    },

    #[error("{writers} writes still in flight when transaction {start_ts} started committing")]
    ConcurrentWriteDuringCommit { start_ts: Timestamp, writers: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(#[from] Box<figment::Error>),

    #[error("{service} unavailable: {message}")]
    Unavailable {
        service: &'static str,
        message: String,
    },

    #[error("Timestamp error: {0}")]
    Timestamp(#[from] TimestampError),

    #[error("Commit index error: {0}")]
    CommitIndex(#[from] TransactionServiceError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl TransactionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransactionError::WriteWriteConflict { .. } => ErrorKind::Conflict,
            TransactionError::LockTimeout { .. } | TransactionError::UserLockTimeout { .. } => {
                ErrorKind::LockTimeout
            }
            TransactionError::CommitLocksExpired { .. }
            | TransactionError::ImmutableTimestampLockExpired { .. }
            | TransactionError::SweptValueRead { .. } => ErrorKind::LockExpired,
            TransactionError::PreCommitConditionFailed { .. } => ErrorKind::PreCommitCondition,
            TransactionError::AmbiguousCommit { .. } => ErrorKind::AmbiguousCommit,
            TransactionError::RolledBackByOther { .. } | TransactionError::AlreadyDecided { .. } => {
                ErrorKind::Failed
            }
            TransactionError::TimestampReuse { .. }
            | TransactionError::MissingConflictingValue { .. }
            | TransactionError::PostFilterExhausted { .. }
            | TransactionError::NonMonotonicCommitTimestamp { .. }
            | TransactionError::Timestamp(_) => ErrorKind::Fatal,
            TransactionError::ConstraintViolation { .. } => ErrorKind::Constraint,
            TransactionError::TransactionClosed { .. }
            | TransactionError::ConcurrentWriteDuringCommit { .. }
            | TransactionError::InvalidArgument(_)
            | TransactionError::InvalidConfiguration(_) => ErrorKind::Invalid,
            TransactionError::Unavailable { .. } => ErrorKind::Unavailable,
            TransactionError::CommitIndex(err) => match err {
                TransactionServiceError::AlreadyExists { .. } => ErrorKind::Failed,
                TransactionServiceError::Ambiguous { .. }
                | TransactionServiceError::Unavailable(_) => ErrorKind::Unavailable,
            },
            TransactionError::Storage(err) => match err {
                // A different value under our own start timestamp.
                StorageError::KeyAlreadyExists { .. } => ErrorKind::Fatal,
                StorageError::InvalidRequest(_) => ErrorKind::Invalid,
                StorageError::Unavailable(_) => ErrorKind::Unavailable,
            },
        }
    }

    /// Whether retrying the whole task in a new transaction may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            TransactionError::PreCommitConditionFailed { retriable, .. } => *retriable,
            _ => self.kind().is_retriable(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimestampError {
    #[error("timestamp overflow, reached {0}")]
    Overflow(u64),
}
