use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use snapkv_common::{RangeRequest, RowResult, TableRef};

use crate::error::TransactionResult;
use crate::transaction::{SnapshotTransaction, merge_rows};

/// Iterator over the visible rows of a range, in row order.
///
/// Each store page is resolved and merged with the transaction's own writes
/// to the same row interval before its rows are yielded. The scan stops at
/// the first error.
pub struct RangeScan<'a> {
    txn: &'a SnapshotTransaction,
    table: TableRef,
    request: RangeRequest,
    next_start_row: Option<Bytes>,
    rows: VecDeque<RowResult<Bytes>>,
}

impl<'a> RangeScan<'a> {
    pub(crate) fn new(txn: &'a SnapshotTransaction, table: TableRef, request: RangeRequest) -> Self {
        let next_start_row = Some(request.start_row().clone());
        Self {
            txn,
            table,
            request,
            next_start_row,
            rows: VecDeque::new(),
        }
    }

    fn fetch_page(&mut self, start_row: Bytes) -> TransactionResult<()> {
        self.txn.ensure_uncommitted()?;
        let page = self.txn.context.kvs.get_range(
            &self.table,
            &self.request.with_start_row(start_row.clone()),
            self.txn.start_ts,
        )?;
        self.txn.validate_read(&self.table)?;

        let mut raw = HashMap::new();
        for row in &page.rows {
            for (cell, value) in row.cells() {
                raw.insert(cell, value.clone());
            }
        }
        let remote = self.txn.resolver(&self.table).resolve(raw)?;
        let local = self.txn.buffer.writes_in_rows(
            &self.table,
            &self.request,
            &start_row,
            page.next_start_row.as_ref(),
        );
        self.rows.extend(merge_rows(remote, local));
        self.next_start_row = page.next_start_row;
        Ok(())
    }
}

impl Iterator for RangeScan<'_> {
    type Item = TransactionResult<RowResult<Bytes>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.rows.pop_front() {
                return Some(Ok(row));
            }
            let start_row = self.next_start_row.take()?;
            if let Err(err) = self.fetch_page(start_row) {
                return Some(Err(err));
            }
        }
    }
}
