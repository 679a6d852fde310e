//! Caller-supplied checks run at commit.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::{TransactionError, TransactionResult};
use crate::lock::LockToken;
use crate::timelock::TimelockService;
use crate::timestamp::Timestamp;

/// A condition that must still hold for a transaction to commit.
///
/// It is checked before the commit starts (with the start timestamp) and
/// once more right before the outcome is published (with the commit
/// timestamp). Read-only transactions check it once.
pub trait PreCommitCondition: Send + Sync {
    fn throw_if_invalid(&self, timestamp: Timestamp) -> TransactionResult<()>;

    /// Called exactly once when the transaction finishes, whatever its outcome.
    fn cleanup(&self) {}
}

impl<F> PreCommitCondition for F
where
    F: Fn(Timestamp) -> TransactionResult<()> + Send + Sync,
{
    fn throw_if_invalid(&self, timestamp: Timestamp) -> TransactionResult<()> {
        self(timestamp)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpCondition;

impl PreCommitCondition for NoOpCondition {
    fn throw_if_invalid(&self, _timestamp: Timestamp) -> TransactionResult<()> {
        Ok(())
    }
}

/// Holds as long as every lock behind `tokens` is still held. The locks are
/// released on cleanup.
pub struct LockTokensCondition {
    timelock: Arc<dyn TimelockService>,
    tokens: Vec<LockToken>,
}

impl LockTokensCondition {
    pub fn new(timelock: Arc<dyn TimelockService>, tokens: Vec<LockToken>) -> Self {
        Self { timelock, tokens }
    }

    pub fn tokens(&self) -> &[LockToken] {
        &self.tokens
    }
}

impl fmt::Debug for LockTokensCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockTokensCondition")
            .field("tokens", &self.tokens)
            .finish()
    }
}

impl PreCommitCondition for LockTokensCondition {
    fn throw_if_invalid(&self, _timestamp: Timestamp) -> TransactionResult<()> {
        let valid = self.timelock.refresh_lock_leases(&self.tokens)?;
        let lost = self.tokens.iter().filter(|token| !valid.contains(token)).count();
        if lost > 0 {
            return Err(TransactionError::PreCommitConditionFailed {
                message: format!("{lost} of {} user locks are no longer held", self.tokens.len()),
                retriable: true,
            });
        }
        Ok(())
    }

    fn cleanup(&self) {
        debug!(locks = self.tokens.len(), "releasing user locks");
        self.timelock.unlock(&self.tokens);
    }
}
