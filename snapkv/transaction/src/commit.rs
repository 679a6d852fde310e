//! The commit protocol.
//!
//! A transaction with writes commits in these steps:
//!
//! 1. lock the written rows or cells together with its own commit lock;
//! 2. check for write-write conflicts;
//! 3. mark itself in progress in the commit index;
//! 4. announce the writes to the sweep queue;
//! 5. write every value to the store at its start timestamp;
//! 6. check that its locks are still held;
//! 7. fetch a commit timestamp;
//! 8. run the commit validator;
//! 9. re-check the pre-commit condition and its locks;
//! 10. publish the commit timestamp in the commit index;
//! 11. release its locks.
//!
//! Publication is the commit point. A failure before it leaves the written
//! versions behind as garbage for readers to skip. A failure during it is
//! ambiguous, since a reader may observe the publication anyway.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use snapkv_common::{Cell, TableRef};
use tracing::{debug, error, info, warn};

use crate::commit_index::{CommitValue, TransactionServiceError};
use crate::config::ConstraintCheckingMode;
use crate::conflict::ConflictDetector;
use crate::error::{ErrorKind, TransactionError, TransactionResult};
use crate::lock::{LockDescriptor, LockRequest, LockToken};
use crate::sweep::WriteInfo;
use crate::table::LockGranularity;
use crate::timestamp::Timestamp;
use crate::transaction::{SnapshotTransaction, TransactionState};
use crate::validation::CommitContext;

type TableWrites = Vec<(TableRef, BTreeMap<Cell, Bytes>)>;

impl SnapshotTransaction {
    pub(crate) fn commit_internal(&self) -> TransactionResult<Timestamp> {
        if let Err(state) = self.transition(TransactionState::Uncommitted, TransactionState::Committing)
        {
            return Err(TransactionError::TransactionClosed {
                start_ts: self.start_ts,
                state,
            });
        }

        let writers = self.active_writers();
        let result = if writers > 0 {
            Err(TransactionError::ConcurrentWriteDuringCommit {
                start_ts: self.start_ts,
                writers,
            })
        } else if self.buffer.is_empty() {
            self.commit_read_only()
        } else {
            self.commit_writes()
        };

        match &result {
            Ok(commit_ts) => {
                if *commit_ts != self.start_ts {
                    let _ = self.commit_ts.set(*commit_ts);
                }
                self.set_state(TransactionState::Committed);
                debug!(start_ts = %self.start_ts, %commit_ts, "transaction committed");
            }
            Err(err) => {
                self.set_state(TransactionState::Failed);
                match err.kind() {
                    ErrorKind::Fatal => {
                        error!(start_ts = %self.start_ts, error = %err, "transaction failed")
                    }
                    ErrorKind::AmbiguousCommit => {
                        warn!(start_ts = %self.start_ts, error = %err, "commit outcome unknown")
                    }
                    _ => info!(start_ts = %self.start_ts, error = %err, "transaction failed"),
                }
            }
        }
        self.finish();
        result
    }

    /// Nothing to publish; the snapshot itself is the result. Returns the
    /// start timestamp.
    fn commit_read_only(&self) -> TransactionResult<Timestamp> {
        self.condition.throw_if_invalid(self.start_ts)?;
        if self.involves_thoroughly_swept_table() {
            self.validate_immutable_lock()?;
        }
        Ok(self.start_ts)
    }

    fn commit_writes(&self) -> TransactionResult<Timestamp> {
        let writes: TableWrites = self
            .buffer
            .tables()
            .into_iter()
            .map(|table| {
                let values = self.buffer.writes_for_table(&table);
                (table, values)
            })
            .collect();
        self.check_constraints(&writes)?;
        self.condition.throw_if_invalid(self.start_ts)?;

        let commit_locks = self.acquire_commit_locks(&writes)?;
        let result = self.commit_with_locks(&writes, commit_locks);
        self.context.timelock.unlock(&[commit_locks]);
        result
    }

    fn commit_with_locks(
        &self,
        writes: &TableWrites,
        commit_locks: LockToken,
    ) -> TransactionResult<Timestamp> {
        self.check_write_write_conflicts(writes)?;

        match self.context.commit_index.mark_in_progress(self.start_ts) {
            Ok(()) => {}
            Err(TransactionServiceError::AlreadyExists {
                existing: CommitValue::Failed,
                ..
            }) => {
                return Err(TransactionError::RolledBackByOther {
                    start_ts: self.start_ts,
                });
            }
            Err(TransactionServiceError::AlreadyExists { existing, .. }) => {
                return Err(TransactionError::AlreadyDecided {
                    start_ts: self.start_ts,
                    existing,
                });
            }
            Err(err) => return Err(err.into()),
        }

        let commit_ts = match self.prepare_publication(writes, commit_locks) {
            Ok(commit_ts) => commit_ts,
            Err(err) => {
                self.roll_back_own_writes();
                return Err(err);
            }
        };
        self.publish(commit_ts)?;
        Ok(commit_ts)
    }

    /// Everything between marking ourselves in progress and publication.
    fn prepare_publication(
        &self,
        writes: &TableWrites,
        commit_locks: LockToken,
    ) -> TransactionResult<Timestamp> {
        let announced: Vec<WriteInfo> = writes
            .iter()
            .flat_map(|(table, values)| {
                values.iter().map(|(cell, value)| WriteInfo {
                    table: table.clone(),
                    cell: cell.clone(),
                    start_ts: self.start_ts,
                    is_tombstone: value.is_empty(),
                })
            })
            .collect();
        self.context.sweep_queue.enqueue(&announced)?;

        for (table, values) in writes {
            let values: HashMap<Cell, Bytes> = values
                .iter()
                .map(|(cell, value)| (cell.clone(), value.clone()))
                .collect();
            self.context.kvs.multi_put(table, &values, self.start_ts)?;
        }
        debug!(start_ts = %self.start_ts, cells = announced.len(), "wrote values");

        self.validate_commit_locks(commit_locks)?;

        let commit_ts = self
            .context
            .timelock
            .get_commit_timestamp(self.start_ts, commit_locks)?;
        if commit_ts <= self.start_ts {
            return Err(TransactionError::NonMonotonicCommitTimestamp {
                start_ts: self.start_ts,
                commit_ts,
            });
        }

        let involved_tables: Vec<TableRef> = self
            .involved_tables
            .iter()
            .map(|table| table.key().clone())
            .collect();
        self.context.validator.validate(&CommitContext {
            start_ts: self.start_ts,
            commit_ts,
            involved_tables: &involved_tables,
            writes,
        })?;

        self.condition.throw_if_invalid(commit_ts)?;
        self.validate_commit_locks(commit_locks)?;
        Ok(commit_ts)
    }

    /// The commit point.
    fn publish(&self, commit_ts: Timestamp) -> TransactionResult<()> {
        let committed = CommitValue::Committed(commit_ts);
        let statuses = &self.context.statuses;
        match self
            .context
            .commit_index
            .put_unless_exists(self.start_ts, committed)
        {
            Ok(()) => {
                statuses.cache().put(self.start_ts, committed);
                Ok(())
            }
            Err(TransactionServiceError::AlreadyExists { existing, .. }) if existing == committed => {
                statuses.cache().put(self.start_ts, committed);
                Ok(())
            }
            Err(TransactionServiceError::AlreadyExists {
                existing: CommitValue::Failed,
                ..
            }) => Err(TransactionError::RolledBackByOther {
                start_ts: self.start_ts,
            }),
            Err(TransactionServiceError::AlreadyExists { existing, .. }) => {
                Err(TransactionError::AlreadyDecided {
                    start_ts: self.start_ts,
                    existing,
                })
            }
            Err(
                err @ (TransactionServiceError::Ambiguous { .. }
                | TransactionServiceError::Unavailable(_)),
            ) => {
                statuses.cache().invalidate(self.start_ts);
                Err(TransactionError::AmbiguousCommit {
                    start_ts: self.start_ts,
                    commit_ts,
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Best effort: decide ourselves as failed so that readers need not wait
    /// for our locks to expire. Never called once publication was attempted.
    fn roll_back_own_writes(&self) {
        match self.context.statuses.rollback(self.start_ts) {
            Ok(CommitValue::Failed) => {}
            Ok(CommitValue::Committed(commit_ts)) => {
                error!(start_ts = %self.start_ts, %commit_ts, "rolled back transaction is committed")
            }
            Err(err) => {
                warn!(start_ts = %self.start_ts, error = %err, "could not roll back own writes")
            }
        }
    }

    fn acquire_commit_locks(&self, writes: &TableWrites) -> TransactionResult<LockToken> {
        let mut request = LockRequest::new(self.context.config.lock_acquire_timeout);
        request.add(LockDescriptor::commit_lock(self.start_ts));
        for (table, values) in writes {
            let handler = self.context.tables.get(table).conflict_handler;
            match handler.lock_granularity() {
                None => {}
                Some(LockGranularity::Row) => {
                    for cell in values.keys() {
                        request.add(LockDescriptor::row(table, cell.row()));
                    }
                }
                Some(LockGranularity::Cell) => {
                    let mut metadata = self.buffer.metadata_for_table(table);
                    for cell in values.keys() {
                        let descriptor = LockDescriptor::cell(table, cell);
                        match metadata.remove(cell) {
                            Some(change) => request.add_with_metadata(descriptor, change),
                            None => request.add(descriptor),
                        }
                    }
                }
            }
        }

        match self.context.timelock.lock(&request)? {
            Some(token) => {
                debug!(start_ts = %self.start_ts, locks = request.len(), "acquired commit locks");
                Ok(token)
            }
            None => Err(TransactionError::LockTimeout {
                start_ts: self.start_ts,
                locks: request.len(),
                timeout: request.acquire_timeout(),
            }),
        }
    }

    fn check_write_write_conflicts(&self, writes: &TableWrites) -> TransactionResult<()> {
        let detector = ConflictDetector::new(&self.context, self.start_ts);
        for (table, values) in writes {
            let handler = self.context.tables.get(table).conflict_handler;
            detector.check(table, handler, values, |cells| {
                self.get_ignoring_local_writes(table, cells)
            })?;
        }
        Ok(())
    }

    fn check_constraints(&self, writes: &TableWrites) -> TransactionResult<()> {
        let mode = self.context.config.constraint_checking_mode;
        if mode == ConstraintCheckingMode::Off || self.context.constraints.is_empty() {
            return Ok(());
        }
        for (table, values) in writes {
            let violations: Vec<String> = self
                .context
                .constraints
                .iter()
                .flat_map(|check| check.check(table, values))
                .collect();
            if violations.is_empty() {
                continue;
            }
            match mode {
                ConstraintCheckingMode::Throw => {
                    return Err(TransactionError::ConstraintViolation {
                        table: table.clone(),
                        violations,
                    });
                }
                ConstraintCheckingMode::LogOnly => {
                    warn!(%table, ?violations, "constraint violations ignored")
                }
                ConstraintCheckingMode::Off => {}
            }
        }
        Ok(())
    }

    /// Commit locks must be held, and so must the immutable timestamp lock if
    /// any thoroughly swept table is involved.
    fn validate_commit_locks(&self, commit_locks: LockToken) -> TransactionResult<()> {
        let immutable_lock = self
            .immutable_lock
            .filter(|_| self.involves_thoroughly_swept_table());
        let mut tokens = vec![commit_locks];
        tokens.extend(immutable_lock);

        let valid = self.context.timelock.refresh_lock_leases(&tokens)?;
        if !valid.contains(&commit_locks) {
            return Err(TransactionError::CommitLocksExpired {
                start_ts: self.start_ts,
            });
        }
        if immutable_lock.is_some_and(|token| !valid.contains(&token)) {
            return Err(TransactionError::ImmutableTimestampLockExpired {
                start_ts: self.start_ts,
            });
        }
        Ok(())
    }

    fn involves_thoroughly_swept_table(&self) -> bool {
        self.involved_tables.iter().any(|table| {
            self.context
                .tables
                .get(table.key())
                .sweep_strategy
                .requires_read_validation()
        })
    }
}
