//! Deciding the fate of other transactions.
//!
//! Reads, sentinel handling and conflict detection all ask the same question
//! about the writers of the versions they see: committed, rolled back, or
//! still undecided. This module is the only place that answers it, and the
//! only place that forces an undecided writer to roll back.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cache::CommitTimestampCache;
use crate::commit_index::{CommitValue, TransactionService, TransactionServiceError};
use crate::error::{TransactionError, TransactionResult};
use crate::lock::{LockDescriptor, LockRequest};
use crate::timelock::TimelockService;
use crate::timestamp::Timestamp;

/// Whether to give in-flight committers a chance to publish before rolling
/// them back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitForCommitters {
    Yes,
    No,
}

pub struct CommitStatusResolver {
    commit_index: Arc<dyn TransactionService>,
    timelock: Arc<dyn TimelockService>,
    cache: Arc<CommitTimestampCache>,
    wait_timeout: Duration,
}

impl CommitStatusResolver {
    pub fn new(
        commit_index: Arc<dyn TransactionService>,
        timelock: Arc<dyn TimelockService>,
        cache: Arc<CommitTimestampCache>,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            commit_index,
            timelock,
            cache,
            wait_timeout,
        }
    }

    pub fn cache(&self) -> &CommitTimestampCache {
        &self.cache
    }

    /// The decided outcomes of the given writers. Writers that are unknown or
    /// still in progress are absent.
    pub fn lookup(
        &self,
        start_timestamps: &BTreeSet<Timestamp>,
    ) -> TransactionResult<HashMap<Timestamp, CommitValue>> {
        let mut decided = HashMap::with_capacity(start_timestamps.len());
        let mut missing = Vec::new();
        for start_ts in start_timestamps {
            match self.cache.get(*start_ts) {
                Some(value) => {
                    decided.insert(*start_ts, value);
                }
                None => missing.push(*start_ts),
            }
        }
        if missing.is_empty() {
            return Ok(decided);
        }
        for (start_ts, entry) in self.commit_index.get_many(&missing)? {
            if let Some(value) = entry.decided() {
                self.cache.put(start_ts, value);
                decided.insert(start_ts, value);
            }
        }
        Ok(decided)
    }

    /// Like [`lookup`](Self::lookup), but every undecided writer is rolled back
    /// so that the result has an outcome for every input.
    pub fn resolve(
        &self,
        start_timestamps: &BTreeSet<Timestamp>,
        wait: WaitForCommitters,
    ) -> TransactionResult<HashMap<Timestamp, CommitValue>> {
        let mut decided = self.lookup(start_timestamps)?;
        let mut undecided: Vec<Timestamp> = start_timestamps
            .iter()
            .filter(|start_ts| !decided.contains_key(*start_ts))
            .copied()
            .collect();
        if undecided.is_empty() {
            return Ok(decided);
        }

        if wait == WaitForCommitters::Yes {
            self.wait_for_committers(&undecided)?;
            let settled = self.lookup(&undecided.iter().copied().collect())?;
            undecided.retain(|start_ts| !settled.contains_key(start_ts));
            decided.extend(settled);
        }

        for start_ts in undecided {
            let value = self.rollback(start_ts)?;
            decided.insert(start_ts, value);
        }
        Ok(decided)
    }

    /// Decide `start_ts` as failed unless it is decided already, and return
    /// whatever outcome ends up in the commit index. Safe to call any number
    /// of times from any number of threads.
    pub fn rollback(&self, start_ts: Timestamp) -> TransactionResult<CommitValue> {
        match self
            .commit_index
            .put_unless_exists(start_ts, CommitValue::Failed)
        {
            Ok(()) => {
                debug!(%start_ts, "rolled back transaction");
                self.cache.put(start_ts, CommitValue::Failed);
                Ok(CommitValue::Failed)
            }
            Err(TransactionServiceError::AlreadyExists { existing, .. }) => {
                self.cache.put(start_ts, existing);
                Ok(existing)
            }
            Err(TransactionServiceError::Ambiguous { reason, .. }) => {
                Err(TransactionError::Unavailable {
                    service: "commit index",
                    message: format!("rollback of {start_ts} is ambiguous: {reason}"),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Wait until the committers of `start_timestamps` released their commit
    /// locks. Committers still holding their locks after the timeout are left
    /// to be rolled back.
    fn wait_for_committers(&self, start_timestamps: &[Timestamp]) -> TransactionResult<()> {
        let request = LockRequest::new(self.wait_timeout).with_descriptors(
            start_timestamps
                .iter()
                .map(|start_ts| LockDescriptor::commit_lock(*start_ts)),
        );
        match self.timelock.lock(&request)? {
            Some(token) => self.timelock.unlock(&[token]),
            None => warn!(
                committers = start_timestamps.len(),
                timeout = ?self.wait_timeout,
                "timed out waiting for committers"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::commit_index::{CommitEntry, InMemoryTransactionService};
    use crate::timelock::InMemoryTimelockService;

    fn ts(raw: u64) -> Timestamp {
        Timestamp::with_ts(raw)
    }

    fn resolver(
        index: Arc<InMemoryTransactionService>,
        timelock: Arc<InMemoryTimelockService>,
    ) -> CommitStatusResolver {
        CommitStatusResolver::new(
            index,
            timelock,
            Arc::new(CommitTimestampCache::new(16)),
            Duration::from_millis(50),
        )
    }

    #[test]
    fn test_lookup_leaves_undecided_absent() {
        let index = Arc::new(InMemoryTransactionService::new());
        index
            .put_unless_exists(ts(1), CommitValue::Committed(ts(3)))
            .unwrap();
        index.mark_in_progress(ts(2)).unwrap();
        let resolver = resolver(index, Arc::new(InMemoryTimelockService::new()));

        let statuses = resolver.lookup(&BTreeSet::from([ts(1), ts(2), ts(4)])).unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[&ts(1)], CommitValue::Committed(ts(3)));
        assert_eq!(resolver.cache().get(ts(1)), Some(CommitValue::Committed(ts(3))));
    }

    #[test]
    fn test_resolve_rolls_back_undecided() {
        let index = Arc::new(InMemoryTransactionService::new());
        index.mark_in_progress(ts(2)).unwrap();
        let resolver = resolver(index.clone(), Arc::new(InMemoryTimelockService::new()));

        let statuses = resolver
            .resolve(&BTreeSet::from([ts(2), ts(5)]), WaitForCommitters::Yes)
            .unwrap();
        assert_eq!(statuses[&ts(2)], CommitValue::Failed);
        assert_eq!(statuses[&ts(5)], CommitValue::Failed);
        assert_eq!(
            index.get(ts(2)).unwrap(),
            Some(CommitEntry::Decided(CommitValue::Failed))
        );
    }

    #[test]
    fn test_rollback_is_idempotent_under_races() {
        let index = Arc::new(InMemoryTransactionService::new());
        let resolver = Arc::new(resolver(
            index.clone(),
            Arc::new(InMemoryTimelockService::new()),
        ));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let resolver = resolver.clone();
                thread::spawn(move || resolver.rollback(ts(7)).unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), CommitValue::Failed);
        }
        assert_eq!(
            index.get(ts(7)).unwrap(),
            Some(CommitEntry::Decided(CommitValue::Failed))
        );
    }

    #[test]
    fn test_rollback_reports_existing_commit() {
        let index = Arc::new(InMemoryTransactionService::new());
        index
            .put_unless_exists(ts(1), CommitValue::Committed(ts(2)))
            .unwrap();
        let resolver = resolver(index, Arc::new(InMemoryTimelockService::new()));
        assert_eq!(resolver.rollback(ts(1)).unwrap(), CommitValue::Committed(ts(2)));
    }

    #[test]
    fn test_waits_for_committer_to_publish() {
        let index = Arc::new(InMemoryTransactionService::new());
        let timelock = Arc::new(InMemoryTimelockService::new());
        let resolver = CommitStatusResolver::new(
            index.clone(),
            timelock.clone(),
            Arc::new(CommitTimestampCache::new(16)),
            Duration::from_secs(10),
        );

        index.mark_in_progress(ts(3)).unwrap();
        let token = timelock
            .lock(
                &LockRequest::new(Duration::ZERO)
                    .with_descriptors([LockDescriptor::commit_lock(ts(3))]),
            )
            .unwrap()
            .unwrap();

        let committer = {
            let index = index.clone();
            let timelock = timelock.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                index
                    .put_unless_exists(ts(3), CommitValue::Committed(ts(4)))
                    .unwrap();
                timelock.unlock(&[token]);
            })
        };

        let statuses = resolver
            .resolve(&BTreeSet::from([ts(3)]), WaitForCommitters::Yes)
            .unwrap();
        committer.join().unwrap();
        assert_eq!(statuses[&ts(3)], CommitValue::Committed(ts(4)));
    }
}
