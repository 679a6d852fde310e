//! The timestamp oracle and lock service consumed by transactions.

use std::collections::HashSet;
use std::time::Duration;

use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::{TransactionError, TransactionResult};
use crate::lock::{LockDescriptor, LockRequest, LockTable, LockToken};
use crate::timestamp::{Timestamp, TimestampGenerator};

/// A held lock on an immutable timestamp.
///
/// While the lock is held, no version that some transaction could still read
/// at or above `immutable_ts` may be removed by sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImmutableTimestampLock {
    pub immutable_ts: Timestamp,
    pub token: LockToken,
}

/// Trait defining the timestamp and lock service.
pub trait TimelockService: Send + Sync {
    /// A timestamp greater than every timestamp handed out before.
    fn fresh_timestamp(&self) -> TransactionResult<Timestamp>;

    /// A fresh timestamp used as the commit timestamp of `start_ts`. The caller
    /// must hold the commit locks identified by `commit_locks`.
    fn get_commit_timestamp(
        &self,
        start_ts: Timestamp,
        commit_locks: LockToken,
    ) -> TransactionResult<Timestamp>;

    /// Lock the current immutable timestamp, keeping it from advancing past
    /// the returned value until the lock is released.
    fn lock_immutable_timestamp(&self) -> TransactionResult<ImmutableTimestampLock>;

    /// The smallest timestamp any live transaction may still read at.
    fn immutable_timestamp(&self) -> TransactionResult<Timestamp>;

    /// Acquire every lock of the request, blocking up to its acquire timeout.
    /// Returns `None` if the locks could not be acquired in time.
    fn lock(&self, request: &LockRequest) -> TransactionResult<Option<LockToken>>;

    /// Extend the leases of the tokens and return the ones still held.
    fn refresh_lock_leases(&self, tokens: &[LockToken]) -> TransactionResult<HashSet<LockToken>>;

    fn unlock(&self, tokens: &[LockToken]);
}

/// Timestamp oracle and lock service kept in process memory.
pub struct InMemoryTimelockService {
    timestamps: TimestampGenerator,
    locks: LockTable,
    /// Timestamps currently protected by an immutable timestamp lock.
    immutable_locks: SkipMap<Timestamp, LockToken>,
    /// Reverse index of `immutable_locks`, so that releases need no scan.
    immutable_by_token: DashMap<LockToken, Timestamp>,
}

impl InMemoryTimelockService {
    pub const DEFAULT_LEASE: Duration = Duration::from_secs(60);

    pub fn new() -> Self {
        Self::with_lease(Self::DEFAULT_LEASE)
    }

    pub fn with_lease(lease: Duration) -> Self {
        Self {
            timestamps: TimestampGenerator::new(),
            locks: LockTable::new(lease),
            immutable_locks: SkipMap::new(),
            immutable_by_token: DashMap::new(),
        }
    }

    /// Forcibly release a grant, as if its lease had run out.
    pub fn revoke(&self, token: LockToken) {
        warn!(%token, "revoking lock grant");
        self.locks.release(&[token]);
        self.forget_immutable(&[token]);
    }

    /// The lock table backing this service.
    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Drop the immutable timestamp entries held by `tokens`. Entries whose
    /// lease ran out are pruned lazily by `immutable_timestamp`.
    fn forget_immutable(&self, tokens: &[LockToken]) {
        for token in tokens {
            if let Some((_, ts)) = self.immutable_by_token.remove(token) {
                self.immutable_locks.remove(&ts);
            }
        }
    }
}

impl Default for InMemoryTimelockService {
    fn default() -> Self {
        Self::new()
    }
}

impl TimelockService for InMemoryTimelockService {
    fn fresh_timestamp(&self) -> TransactionResult<Timestamp> {
        Ok(self.timestamps.next()?)
    }

    fn get_commit_timestamp(
        &self,
        start_ts: Timestamp,
        commit_locks: LockToken,
    ) -> TransactionResult<Timestamp> {
        let commit_ts = self.timestamps.next()?;
        debug!(%start_ts, %commit_ts, %commit_locks, "issued commit timestamp");
        Ok(commit_ts)
    }

    fn lock_immutable_timestamp(&self) -> TransactionResult<ImmutableTimestampLock> {
        let ts = self.timestamps.next()?;
        let request = LockRequest::new(Duration::ZERO)
            .with_descriptors([LockDescriptor::immutable_timestamp(ts)]);
        // Every timestamp is handed out once, so the descriptor is always free.
        let token = self
            .locks
            .acquire(&request)
            .ok_or_else(|| TransactionError::Unavailable {
                service: "timelock",
                message: format!("immutable timestamp {ts} is already locked"),
            })?;
        self.immutable_locks.insert(ts, token);
        self.immutable_by_token.insert(token, ts);
        Ok(ImmutableTimestampLock {
            immutable_ts: self.immutable_timestamp()?,
            token,
        })
    }

    /// Mirrors a watermark: the oldest locked timestamp, or the next timestamp
    /// to be issued when nothing is locked.
    fn immutable_timestamp(&self) -> TransactionResult<Timestamp> {
        while let Some(entry) = self.immutable_locks.front() {
            if self.locks.is_valid(entry.value()) {
                return Ok(*entry.key());
            }
            self.immutable_by_token.remove(entry.value());
            entry.remove();
        }
        Ok(self.timestamps.current())
    }

    fn lock(&self, request: &LockRequest) -> TransactionResult<Option<LockToken>> {
        Ok(self.locks.acquire(request))
    }

    fn refresh_lock_leases(&self, tokens: &[LockToken]) -> TransactionResult<HashSet<LockToken>> {
        Ok(self.locks.refresh(tokens))
    }

    fn unlock(&self, tokens: &[LockToken]) {
        self.locks.release(tokens);
        self.forget_immutable(tokens);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_timestamps_are_fresh() {
        let timelock = InMemoryTimelockService::new();
        let start = timelock.fresh_timestamp().unwrap();
        let token = timelock
            .lock(
                &LockRequest::new(Duration::ZERO)
                    .with_descriptors([LockDescriptor::commit_lock(start)]),
            )
            .unwrap()
            .unwrap();
        let commit = timelock.get_commit_timestamp(start, token).unwrap();
        assert!(commit > start);
    }

    #[test]
    fn test_immutable_timestamp_follows_oldest_lock() {
        let timelock = InMemoryTimelockService::new();
        let first = timelock.lock_immutable_timestamp().unwrap();
        let second = timelock.lock_immutable_timestamp().unwrap();
        assert_eq!(second.immutable_ts, first.immutable_ts);
        assert_eq!(timelock.immutable_timestamp().unwrap(), first.immutable_ts);

        timelock.unlock(&[first.token]);
        let advanced = timelock.immutable_timestamp().unwrap();
        assert!(advanced > first.immutable_ts);

        timelock.unlock(&[second.token]);
        assert_eq!(
            timelock.immutable_timestamp().unwrap(),
            timelock.fresh_timestamp().unwrap()
        );
    }

    #[test]
    fn test_revoked_locks_fail_refresh() {
        let timelock = InMemoryTimelockService::new();
        let token = timelock
            .lock(
                &LockRequest::new(Duration::ZERO)
                    .with_descriptors([LockDescriptor::advisory(&b"a"[..])]),
            )
            .unwrap()
            .unwrap();
        assert!(timelock.refresh_lock_leases(&[token]).unwrap().contains(&token));
        timelock.revoke(token);
        assert!(timelock.refresh_lock_leases(&[token]).unwrap().is_empty());
    }

    #[test]
    fn test_released_immutable_locks_are_forgotten() {
        let timelock = InMemoryTimelockService::new();
        let pinned = timelock.lock_immutable_timestamp().unwrap();

        for _ in 0..100 {
            let lock = timelock.lock_immutable_timestamp().unwrap();
            timelock.unlock(&[lock.token]);
        }
        let revoked = timelock.lock_immutable_timestamp().unwrap();
        timelock.revoke(revoked.token);

        assert_eq!(timelock.immutable_locks.len(), 1);
        assert_eq!(timelock.immutable_by_token.len(), 1);
        assert_eq!(timelock.immutable_timestamp().unwrap(), pinned.immutable_ts);

        timelock.unlock(&[pinned.token]);
        assert!(timelock.immutable_locks.is_empty());
        assert!(timelock.immutable_by_token.is_empty());
    }
}
