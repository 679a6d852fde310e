//! Commit-time write-write conflict detection.
//!
//! Under snapshot isolation two transactions conflict when both wrote the same
//! cell and their lifetimes overlapped. With our commit locks held, the newest
//! committed version of every written cell tells us whether somebody else
//! committed a write we could not have seen:
//!
//! * a *spanning* write started before us and committed after we started;
//! * a *dominating* write started after us and has already committed.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bytes::Bytes;
use itertools::Itertools;
use snapkv_common::{Cell, TableRef};
use tracing::debug;

use crate::commit_index::CommitValue;
use crate::context::EngineContext;
use crate::error::{TransactionError, TransactionResult};
use crate::resolver::DIAGNOSTIC_SAMPLE;
use crate::rollback::WaitForCommitters;
use crate::table::ConflictHandler;
use crate::timestamp::Timestamp;

/// A committed write that overlaps with ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellConflict {
    pub cell: Cell,
    pub their_start_ts: Timestamp,
    pub their_commit_ts: Timestamp,
}

pub(crate) struct ConflictDetector<'a> {
    context: &'a EngineContext,
    start_ts: Timestamp,
}

impl<'a> ConflictDetector<'a> {
    pub fn new(context: &'a EngineContext, start_ts: Timestamp) -> Self {
        Self { context, start_ts }
    }

    /// Fails with a write-write conflict if any of `writes` overlaps with a
    /// committed write of another transaction. `read_snapshot` returns the
    /// values our snapshot sees for the given cells, ignoring our own writes;
    /// it is only consulted by handlers that ignore unchanged values.
    pub fn check<F>(
        &self,
        table: &TableRef,
        handler: ConflictHandler,
        writes: &BTreeMap<Cell, Bytes>,
        read_snapshot: F,
    ) -> TransactionResult<()>
    where
        F: FnOnce(&[Cell]) -> TransactionResult<HashMap<Cell, Bytes>>,
    {
        if !handler.checks_write_write_conflicts() || writes.is_empty() {
            return Ok(());
        }
        let (mut spanning, mut dominating) = self.find_overlapping_writes(table, writes)?;
        if spanning.is_empty() && dominating.is_empty() {
            return Ok(());
        }

        if handler.ignores_unchanged_values() {
            let cells: Vec<Cell> = spanning
                .iter()
                .chain(&dominating)
                .map(|conflict| conflict.cell.clone())
                .sorted()
                .dedup()
                .collect();
            let snapshot = read_snapshot(&cells)?;
            let unchanged = |conflict: &CellConflict| {
                self.is_unchanged(table, conflict, writes, &snapshot)
            };
            spanning = retain_changed(spanning, unchanged)?;
            dominating = retain_changed(dominating, unchanged)?;
            if spanning.is_empty() && dominating.is_empty() {
                debug!(%table, start_ts = %self.start_ts, "conflicts left every value unchanged");
                return Ok(());
            }
        }

        debug!(
            %table,
            start_ts = %self.start_ts,
            spanning = spanning.len(),
            dominating = dominating.len(),
            "write-write conflict"
        );
        Err(TransactionError::WriteWriteConflict {
            table: table.clone(),
            start_ts: self.start_ts,
            spanning,
            dominating,
        })
    }

    /// Walk down from the newest version of every written cell to the newest
    /// one that was not rolled back, and classify it.
    fn find_overlapping_writes(
        &self,
        table: &TableRef,
        writes: &BTreeMap<Cell, Bytes>,
    ) -> TransactionResult<(Vec<CellConflict>, Vec<CellConflict>)> {
        let max_iterations = self.context.config.max_post_filter_iterations;
        let mut spanning = Vec::new();
        let mut dominating = Vec::new();
        let mut pending: HashMap<Cell, Timestamp> =
            writes.keys().map(|cell| (cell.clone(), Timestamp::MAX)).collect();
        let mut iterations = 0;

        while !pending.is_empty() {
            if iterations >= max_iterations {
                return Err(TransactionError::PostFilterExhausted {
                    table: table.clone(),
                    iterations,
                    sample: pending.into_keys().take(DIAGNOSTIC_SAMPLE).collect(),
                });
            }
            iterations += 1;

            let latest = self.context.kvs.get_latest_timestamps(table, &pending)?;
            let mut writers = BTreeSet::new();
            for (cell, their_start_ts) in &latest {
                if *their_start_ts == self.start_ts {
                    return Err(TransactionError::TimestampReuse {
                        table: table.clone(),
                        cell: cell.clone(),
                        start_ts: self.start_ts,
                    });
                }
                if !their_start_ts.is_sweep_sentinel() {
                    writers.insert(*their_start_ts);
                }
            }
            // Our commit locks keep new writers away, so whoever is still
            // undecided here lost its locks and can be rolled back directly.
            let statuses = self
                .context
                .statuses
                .resolve(&writers, WaitForCommitters::No)?;

            let mut reload = HashMap::new();
            let mut garbage: HashMap<Cell, Vec<Timestamp>> = HashMap::new();
            for (cell, their_start_ts) in latest {
                if their_start_ts.is_sweep_sentinel() {
                    continue;
                }
                match statuses.get(&their_start_ts) {
                    Some(CommitValue::Committed(their_commit_ts)) => {
                        let their_commit_ts = *their_commit_ts;
                        if their_commit_ts == self.start_ts {
                            return Err(TransactionError::TimestampReuse {
                                table: table.clone(),
                                cell,
                                start_ts: self.start_ts,
                            });
                        }
                        let conflict = CellConflict {
                            cell,
                            their_start_ts,
                            their_commit_ts,
                        };
                        if their_start_ts > self.start_ts {
                            dominating.push(conflict);
                        } else if their_commit_ts > self.start_ts {
                            spanning.push(conflict);
                        }
                    }
                    Some(CommitValue::Failed) => {
                        garbage.entry(cell.clone()).or_default().push(their_start_ts);
                        reload.insert(cell, their_start_ts);
                    }
                    None => {
                        reload.insert(cell, their_start_ts);
                    }
                }
            }
            if !garbage.is_empty() {
                self.context.cleaner.schedule(table, garbage);
            }
            pending = reload;
        }
        Ok((spanning, dominating))
    }

    /// Our old value, our new value and the conflicting value are all equal.
    fn is_unchanged(
        &self,
        table: &TableRef,
        conflict: &CellConflict,
        writes: &BTreeMap<Cell, Bytes>,
        snapshot: &HashMap<Cell, Bytes>,
    ) -> TransactionResult<bool> {
        let bound = conflict
            .their_start_ts
            .checked_next()
            .unwrap_or(Timestamp::MAX);
        let mut current = self
            .context
            .kvs
            .get(table, &HashMap::from([(conflict.cell.clone(), bound)]))?;
        let Some(current) = current
            .remove(&conflict.cell)
            .filter(|value| value.timestamp() == conflict.their_start_ts)
        else {
            return Err(TransactionError::MissingConflictingValue {
                table: table.clone(),
                cell: conflict.cell.clone(),
                their_start_ts: conflict.their_start_ts,
            });
        };
        let new = writes.get(&conflict.cell).cloned().unwrap_or_default();
        // Absent and deleted read the same.
        let old = snapshot.get(&conflict.cell).cloned().unwrap_or_default();
        Ok(old == new && new == *current.contents())
    }
}

fn retain_changed<F>(
    conflicts: Vec<CellConflict>,
    is_unchanged: F,
) -> TransactionResult<Vec<CellConflict>>
where
    F: Fn(&CellConflict) -> TransactionResult<bool>,
{
    let mut changed = Vec::with_capacity(conflicts.len());
    for conflict in conflicts {
        if !is_unchanged(&conflict)? {
            changed.push(conflict);
        }
    }
    Ok(changed)
}
