use super::{EntityReader, SourceAdapter, log_read_failure};
use crate::data_sync::aggregator::UpdateSink;
use crate::data_sync::registry::CellMap;
use crate::types::{CellValue, EntityId};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// One read per entity when the pipeline subscribes, skipping entities that are already
/// resolved. Reads run concurrently and each result is emitted as soon as it lands.
pub struct BootstrapFetch<T> {
    reader: Arc<dyn EntityReader<T>>,
    ids: Vec<EntityId>,
    cells: Arc<CellMap<T>>,
}

impl<T: CellValue> BootstrapFetch<T> {
    pub fn new(reader: Arc<dyn EntityReader<T>>, ids: Vec<EntityId>, cells: Arc<CellMap<T>>) -> Self {
        Self { reader, ids, cells }
    }

    fn unresolved(&self) -> Vec<EntityId> {
        self.ids
            .iter()
            .filter(|id| self.cells.try_get(id).is_some_and(|cell| !cell.is_resolved()))
            .copied()
            .collect()
    }
}

impl<T: CellValue> SourceAdapter<T> for BootstrapFetch<T> {
    fn name(&self) -> &'static str {
        "bootstrap"
    }

    fn spawn(&self, sink: UpdateSink<T>) -> JoinHandle<()> {
        let pending = self.unresolved();
        let reader = Arc::clone(&self.reader);
        let fact = self.cells.fact();

        tokio::spawn(async move {
            info!("{} bootstrap: fetching {} unresolved entities", fact, pending.len());
            let epoch = sink.current_epoch();

            let mut reads: FuturesUnordered<_> = pending
                .into_iter()
                .map(|id| {
                    let reader = Arc::clone(&reader);
                    async move { (id, reader.read(id).await) }
                })
                .collect();

            let (mut resolved, mut failed) = (0usize, 0usize);
            while let Some((id, result)) = reads.next().await {
                match result {
                    Ok(value) => {
                        resolved += 1;
                        if !sink.emit_at(epoch, [(id, value)].into()).await {
                            debug!("{} bootstrap: pipeline closed", fact);
                            return;
                        }
                    }
                    Err(e) => {
                        failed += 1;
                        log_read_failure("bootstrap", &id, &e);
                    }
                }
            }

            info!("{} bootstrap finished: {} resolved, {} failed", fact, resolved, failed);
        })
    }
}
