/// Source Adapters
///
/// Each adapter turns one way of obtaining entity data into partial updates for a
/// pipeline:
/// - `BootstrapFetch`: one read per unresolved entity when the pipeline subscribes
/// - `ChangeListener`: a point read whenever the ledger pushes a transfer notification
/// - `IntervalPoll`: periodic re-read of a cohort
///
/// Adapters run as independent tasks and swallow their own read failures, so one
/// entity failing never stops the merged stream.
pub mod bootstrap;
pub mod listener;
pub mod poll;
pub mod readers;

use super::aggregator::UpdateSink;
use crate::error::{SyncError, SyncResult};
use crate::types::{CellValue, EntityId};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub use bootstrap::BootstrapFetch;
pub use listener::ChangeListener;
pub use poll::{Cohort, IntervalPoll};
pub use readers::{AprReader, BalanceReader, FeeReader};

pub trait SourceAdapter<T: CellValue>: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start producing updates into `sink`. The task ends when the sink closes or the
    /// handle is aborted.
    fn spawn(&self, sink: UpdateSink<T>) -> JoinHandle<()>;
}

/// Point read of one fact for one entity.
#[async_trait]
pub trait EntityReader<T>: Send + Sync {
    async fn read(&self, id: EntityId) -> SyncResult<T>;
}

pub(crate) fn log_read_failure(adapter: &str, id: &EntityId, error: &SyncError) {
    match error {
        SyncError::NoSigner => debug!("{}: skipping {} without an active signer", adapter, id),
        e if !e.is_recoverable() => error!("{}: read for {} failed: {}", adapter, id, e),
        _ => warn!("{}: read for {} failed: {}", adapter, id, error),
    }
}
