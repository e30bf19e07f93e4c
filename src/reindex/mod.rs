//! Background reindex coordinator: durable jobs, worker loop, and the
//! per-job state machine.

mod commands;
mod task;
mod throttle;
mod worker;

use std::sync::Arc;

use crate::db::{JobStore, StoreBackend};
use crate::search::{SearchIndexer, SupportResolver};

pub use commands::{cancel_reindex, create_reindex, get_reindex};
pub use task::{ReindexTask, TaskExit};
pub use throttle::{AdaptiveThrottle, BatchDirective, ThrottleOracle};
pub use worker::{CancelRegistry, ReindexWorker, ReindexWorkerConfig};

/// Everything a worker or task needs, injected at construction. No global
/// state.
#[derive(Clone)]
pub struct ReindexContext {
    pub store: Arc<dyn StoreBackend>,
    pub jobs: Arc<dyn JobStore>,
    pub resolver: Arc<dyn SupportResolver>,
    pub indexer: Arc<dyn SearchIndexer>,
    pub throttle: Arc<dyn ThrottleOracle>,
}
