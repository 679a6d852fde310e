//! Filtering raw store versions down to what a snapshot may see.
//!
//! The store returns, for every cell, the newest version below the read
//! timestamp, whoever wrote it. A version is visible only if its writer
//! committed no later than the reader started. Invisible versions are skipped
//! by re-reading the cell below them, which may in turn surface another
//! invisible version, so resolution runs in rounds.

use std::collections::{BTreeSet, HashMap, HashSet};

use bytes::Bytes;
use snapkv_common::{Cell, TableRef, Value};
use tracing::{debug, trace};

use crate::commit_index::CommitValue;
use crate::config::ReadSentinelBehavior;
use crate::context::EngineContext;
use crate::error::{TransactionError, TransactionResult};
use crate::rollback::WaitForCommitters;
use crate::timestamp::Timestamp;

/// Cells named in diagnostics when resolution gives up.
pub(crate) const DIAGNOSTIC_SAMPLE: usize = 10;

pub(crate) struct ReadResolver<'a> {
    context: &'a EngineContext,
    table: &'a TableRef,
    start_ts: Timestamp,
    sentinel_behavior: ReadSentinelBehavior,
}

impl<'a> ReadResolver<'a> {
    pub fn new(
        context: &'a EngineContext,
        table: &'a TableRef,
        start_ts: Timestamp,
        sentinel_behavior: ReadSentinelBehavior,
    ) -> Self {
        Self {
            context,
            table,
            start_ts,
            sentinel_behavior,
        }
    }

    /// Reduce raw versions read at `start_ts` to the visible contents.
    /// Cells whose visible version is a delete, or that have none, are absent.
    pub fn resolve(&self, raw: HashMap<Cell, Value>) -> TransactionResult<HashMap<Cell, Bytes>> {
        let max_iterations = self.context.config.max_post_filter_iterations;
        let mut visible = HashMap::with_capacity(raw.len());
        let mut pending = raw;
        let mut iterations = 0;

        while !pending.is_empty() {
            if iterations >= max_iterations {
                return Err(TransactionError::PostFilterExhausted {
                    table: self.table.clone(),
                    iterations,
                    sample: pending.into_keys().take(DIAGNOSTIC_SAMPLE).collect(),
                });
            }
            iterations += 1;

            let (sentinels, versions): (Vec<_>, Vec<_>) = pending
                .into_iter()
                .partition(|(_, value)| value.is_sweep_sentinel());
            self.check_sentinels(sentinels.into_iter().map(|(cell, _)| cell).collect())?;

            let writers: BTreeSet<Timestamp> =
                versions.iter().map(|(_, value)| value.timestamp()).collect();
            let statuses = self
                .context
                .statuses
                .resolve(&writers, WaitForCommitters::Yes)?;

            let mut reload = HashMap::new();
            let mut garbage: HashMap<Cell, Vec<Timestamp>> = HashMap::new();
            for (cell, value) in versions {
                let writer = value.timestamp();
                match statuses.get(&writer) {
                    Some(CommitValue::Committed(commit_ts)) if *commit_ts <= self.start_ts => {
                        if !value.is_tombstone() {
                            visible.insert(cell, value.into_contents());
                        }
                    }
                    Some(CommitValue::Failed) => {
                        garbage.entry(cell.clone()).or_default().push(writer);
                        reload.insert(cell, writer);
                    }
                    // Committed after we started: look further back.
                    Some(CommitValue::Committed(_)) | None => {
                        reload.insert(cell, writer);
                    }
                }
            }

            if !garbage.is_empty() {
                trace!(table = %self.table, cells = garbage.len(), "skipping garbage versions");
                self.context.cleaner.schedule(self.table, garbage);
            }
            pending = if reload.is_empty() {
                HashMap::new()
            } else {
                self.context.kvs.get(self.table, &reload)?
            };
        }

        if iterations > 1 {
            debug!(table = %self.table, iterations, "resolved reads in several rounds");
        }
        Ok(visible)
    }

    /// Sentinels never produce a value; a non-orphaned one may fail the read.
    fn check_sentinels(&self, cells: Vec<Cell>) -> TransactionResult<()> {
        if cells.is_empty() || self.sentinel_behavior == ReadSentinelBehavior::Ignore {
            return Ok(());
        }
        let orphaned = self.orphaned_sentinels(&cells)?;
        match cells.into_iter().find(|cell| !orphaned.contains(cell)) {
            Some(cell) => Err(TransactionError::SweptValueRead {
                table: self.table.clone(),
                cell,
                start_ts: self.start_ts,
            }),
            None => Ok(()),
        }
    }

    /// A sentinel is orphaned when every version above it was written by a
    /// transaction that is known to have been rolled back.
    fn orphaned_sentinels(&self, cells: &[Cell]) -> TransactionResult<HashSet<Cell>> {
        let versions = self
            .context
            .kvs
            .get_all_timestamps(self.table, cells, Timestamp::MAX)?;
        let above = |cell: &Cell| {
            versions
                .get(cell)
                .into_iter()
                .flatten()
                .copied()
                .filter(|ts| !ts.is_sweep_sentinel())
        };

        let writers: BTreeSet<Timestamp> = cells.iter().flat_map(above).collect();
        let statuses = self.context.statuses.lookup(&writers)?;
        Ok(cells
            .iter()
            .filter(|cell| {
                above(cell).all(|writer| statuses.get(&writer) == Some(&CommitValue::Failed))
            })
            .cloned()
            .collect())
    }
}
