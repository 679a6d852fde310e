//! Asynchronous deletion of versions written by failed transactions.
//!
//! Readers that run into garbage skip it synchronously and hand the versions
//! over to a single background worker. Tasks carry only what to delete, never
//! a handle to the transaction that found them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use snapkv_common::{Cell, TableRef};
use snapkv_storage::KeyValueService;
use tracing::{debug, warn};

use crate::error::{TransactionError, TransactionResult};
use crate::timestamp::Timestamp;

enum CleanerTask {
    Delete {
        table: TableRef,
        versions: HashMap<Cell, Vec<Timestamp>>,
    },
    Flush(Sender<()>),
}

#[derive(Default)]
struct CleanerStats {
    deleted: AtomicU64,
    dropped: AtomicU64,
}

pub struct GarbageCleaner {
    sender: Option<Sender<CleanerTask>>,
    worker: Option<JoinHandle<()>>,
    stats: Arc<CleanerStats>,
}

impl GarbageCleaner {
    /// Spawn the worker thread with a queue of at most `capacity` tasks.
    pub fn start(kvs: Arc<dyn KeyValueService>, capacity: usize) -> TransactionResult<Self> {
        let (sender, receiver) = bounded(capacity.max(1));
        let stats = Arc::new(CleanerStats::default());
        let worker = {
            let stats = stats.clone();
            thread::Builder::new()
                .name("snapkv-garbage-cleaner".into())
                .spawn(move || run_worker(kvs, receiver, stats))
                .map_err(|err| TransactionError::Unavailable {
                    service: "garbage cleaner",
                    message: err.to_string(),
                })?
        };
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            stats,
        })
    }

    /// Queue versions for deletion without blocking. Returns false if the task
    /// was dropped because the queue is full; the versions stay garbage and
    /// will be found again by a later reader.
    pub fn schedule(&self, table: &TableRef, versions: HashMap<Cell, Vec<Timestamp>>) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        let task = CleanerTask::Delete {
            table: table.clone(),
            versions,
        };
        match sender.try_send(task) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(%table, "cleaner queue full, dropping garbage deletion");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Block until every task queued before this call has been processed.
    pub fn flush(&self) {
        let Some(sender) = &self.sender else {
            return;
        };
        let (done_tx, done_rx) = bounded(1);
        if sender.send(CleanerTask::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }

    /// Number of versions deleted so far.
    pub fn deleted_versions(&self) -> u64 {
        self.stats.deleted.load(Ordering::Relaxed)
    }

    /// Number of tasks dropped because the queue was full.
    pub fn dropped_tasks(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for GarbageCleaner {
    fn drop(&mut self) {
        // Closing the channel stops the worker once the queue is drained.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("garbage cleaner worker panicked");
            }
        }
    }
}

fn run_worker(
    kvs: Arc<dyn KeyValueService>,
    receiver: Receiver<CleanerTask>,
    stats: Arc<CleanerStats>,
) {
    for task in receiver {
        match task {
            CleanerTask::Delete { table, versions } => {
                let count: usize = versions.values().map(Vec::len).sum();
                match kvs.delete(&table, &versions) {
                    Ok(()) => {
                        stats.deleted.fetch_add(count as u64, Ordering::Relaxed);
                        debug!(%table, versions = count, "deleted garbage versions");
                    }
                    Err(err) => warn!(%table, error = %err, "failed to delete garbage versions"),
                }
            }
            CleanerTask::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
