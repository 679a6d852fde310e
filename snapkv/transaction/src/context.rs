use std::sync::Arc;

use snapkv_storage::KeyValueService;

use crate::cleaner::GarbageCleaner;
use crate::commit_index::TransactionService;
use crate::config::TransactionConfig;
use crate::rollback::CommitStatusResolver;
use crate::sweep::SweepQueueWriter;
use crate::table::TableRegistry;
use crate::timelock::TimelockService;
use crate::validation::{CommitValidator, ConstraintCheck};

/// Services shared by a manager and every transaction it started.
pub(crate) struct EngineContext {
    pub kvs: Arc<dyn KeyValueService>,
    pub timelock: Arc<dyn TimelockService>,
    pub commit_index: Arc<dyn TransactionService>,
    pub sweep_queue: Arc<dyn SweepQueueWriter>,
    pub statuses: CommitStatusResolver,
    pub cleaner: GarbageCleaner,
    pub tables: TableRegistry,
    pub validator: Arc<dyn CommitValidator>,
    pub constraints: Vec<Arc<dyn ConstraintCheck>>,
    pub config: TransactionConfig,
}
