//! The commit index: the single source of truth for whether a transaction
//! committed, and at which timestamp.
//!
//! Every entry is written once. A reader that finds no decided entry for a
//! writer may decide it by writing `Failed`; whoever writes first wins.

use std::collections::HashMap;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::timestamp::Timestamp;

/// The decided outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommitValue {
    Committed(Timestamp),
    Failed,
}

impl CommitValue {
    pub fn commit_ts(&self) -> Option<Timestamp> {
        match self {
            CommitValue::Committed(ts) => Some(*ts),
            CommitValue::Failed => None,
        }
    }
}

/// What the commit index knows about a start timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitEntry {
    /// The writer announced it is committing but has not published yet.
    InProgress,
    Decided(CommitValue),
}

impl CommitEntry {
    pub fn decided(&self) -> Option<CommitValue> {
        match self {
            CommitEntry::InProgress => None,
            CommitEntry::Decided(value) => Some(*value),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionServiceError {
    #[error("Transaction {start_ts} is already decided as {existing:?}")]
    AlreadyExists {
        start_ts: Timestamp,
        existing: CommitValue,
    },

    #[error("Outcome of the write for transaction {start_ts} is unknown: {reason}")]
    Ambiguous { start_ts: Timestamp, reason: String },

    #[error("{0}")]
    Unavailable(String),
}

pub type TransactionServiceResult<T> = Result<T, TransactionServiceError>;

/// Trait defining the commit index.
pub trait TransactionService: Send + Sync {
    fn get(&self, start_ts: Timestamp) -> TransactionServiceResult<Option<CommitEntry>>;

    /// Entries of every known start timestamp. Unknown ones are absent.
    fn get_many(
        &self,
        start_timestamps: &[Timestamp],
    ) -> TransactionServiceResult<HashMap<Timestamp, CommitEntry>> {
        let mut entries = HashMap::with_capacity(start_timestamps.len());
        for start_ts in start_timestamps {
            if let Some(entry) = self.get(*start_ts)? {
                entries.insert(*start_ts, entry);
            }
        }
        Ok(entries)
    }

    /// Record that `start_ts` is committing. Fails with `AlreadyExists` if it
    /// was decided already, typically rolled back by a reader.
    fn mark_in_progress(&self, start_ts: Timestamp) -> TransactionServiceResult<()>;

    /// Decide `start_ts` unless it is decided already.
    fn put_unless_exists(
        &self,
        start_ts: Timestamp,
        value: CommitValue,
    ) -> TransactionServiceResult<()>;
}

/// Commit index kept in process memory.
#[derive(Default)]
pub struct InMemoryTransactionService {
    entries: DashMap<Timestamp, CommitEntry>,
}

impl InMemoryTransactionService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TransactionService for InMemoryTransactionService {
    fn get(&self, start_ts: Timestamp) -> TransactionServiceResult<Option<CommitEntry>> {
        Ok(self.entries.get(&start_ts).map(|entry| *entry))
    }

    fn mark_in_progress(&self, start_ts: Timestamp) -> TransactionServiceResult<()> {
        match self.entries.entry(start_ts) {
            Entry::Occupied(entry) => match *entry.get() {
                CommitEntry::InProgress => Ok(()),
                CommitEntry::Decided(existing) => Err(TransactionServiceError::AlreadyExists {
                    start_ts,
                    existing,
                }),
            },
            Entry::Vacant(entry) => {
                entry.insert(CommitEntry::InProgress);
                Ok(())
            }
        }
    }

    fn put_unless_exists(
        &self,
        start_ts: Timestamp,
        value: CommitValue,
    ) -> TransactionServiceResult<()> {
        match self.entries.entry(start_ts) {
            Entry::Occupied(mut entry) => match *entry.get() {
                CommitEntry::InProgress => {
                    entry.insert(CommitEntry::Decided(value));
                    Ok(())
                }
                CommitEntry::Decided(existing) => Err(TransactionServiceError::AlreadyExists {
                    start_ts,
                    existing,
                }),
            },
            Entry::Vacant(entry) => {
                entry.insert(CommitEntry::Decided(value));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn ts(raw: u64) -> Timestamp {
        Timestamp::with_ts(raw)
    }

    #[test]
    fn test_entries_are_write_once() {
        let index = InMemoryTransactionService::new();
        index
            .put_unless_exists(ts(1), CommitValue::Committed(ts(2)))
            .unwrap();
        let err = index
            .put_unless_exists(ts(1), CommitValue::Failed)
            .unwrap_err();
        assert_eq!(
            err,
            TransactionServiceError::AlreadyExists {
                start_ts: ts(1),
                existing: CommitValue::Committed(ts(2)),
            }
        );
        assert_eq!(
            index.get(ts(1)).unwrap(),
            Some(CommitEntry::Decided(CommitValue::Committed(ts(2))))
        );
    }

    #[test]
    fn test_in_progress_can_be_decided() {
        let index = InMemoryTransactionService::new();
        index.mark_in_progress(ts(5)).unwrap();
        assert_eq!(index.get(ts(5)).unwrap(), Some(CommitEntry::InProgress));
        index.put_unless_exists(ts(5), CommitValue::Failed).unwrap();
        assert!(matches!(
            index.mark_in_progress(ts(5)),
            Err(TransactionServiceError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_get_many_skips_unknown() {
        let index = InMemoryTransactionService::new();
        index.put_unless_exists(ts(1), CommitValue::Failed).unwrap();
        let entries = index.get_many(&[ts(1), ts(9)]).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[&ts(1)].decided(), Some(CommitValue::Failed));
    }

    #[test]
    fn test_racing_writers_agree_on_one_outcome() {
        let index = Arc::new(InMemoryTransactionService::new());
        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let index = index.clone();
                thread::spawn(move || {
                    let value = if i % 2 == 0 {
                        CommitValue::Failed
                    } else {
                        CommitValue::Committed(ts(100 + i))
                    };
                    index.put_unless_exists(ts(1), value).is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
