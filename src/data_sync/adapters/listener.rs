use super::{EntityReader, SourceAdapter, log_read_failure};
use crate::data_sync::aggregator::UpdateSink;
use crate::data_sync::session::Session;
use crate::ledger::LedgerClient;
use crate::types::{CellValue, EntityId, TransferEvent};
use alloy_primitives::Address;
use futures::stream::{self, BoxStream, FuturesUnordered};
use futures::{FutureExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Re-reads a token whenever the ledger reports a `Transfer` from or to the active wallet.
pub struct ChangeListener<T> {
    ledger: Arc<dyn LedgerClient>,
    reader: Arc<dyn EntityReader<T>>,
    ids: Vec<EntityId>,
    session: Session,
}

impl<T: CellValue> ChangeListener<T> {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        reader: Arc<dyn EntityReader<T>>,
        ids: Vec<EntityId>,
        session: Session,
    ) -> Self {
        Self { ledger, reader, ids, session }
    }
}

fn receiver_stream(rx: mpsc::Receiver<TransferEvent>) -> BoxStream<'static, TransferEvent> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) }).boxed()
}

/// Register sender and receiver filtered notifications for every token.
async fn register(
    ledger: &dyn LedgerClient,
    ids: &[EntityId],
    wallet: Address,
) -> Vec<BoxStream<'static, TransferEvent>> {
    let mut streams = Vec::with_capacity(ids.len() * 2);
    for id in ids {
        for (from, to) in [(Some(wallet), None), (None, Some(wallet))] {
            match ledger.on_transfer(id.network, id.address, from, to).await {
                Ok(rx) => streams.push(receiver_stream(rx)),
                Err(e) => warn!("Failed to listen for transfers of {}: {}", id, e),
            }
        }
    }
    streams
}

impl<T: CellValue> SourceAdapter<T> for ChangeListener<T> {
    fn name(&self) -> &'static str {
        "change_listener"
    }

    fn spawn(&self, sink: UpdateSink<T>) -> JoinHandle<()> {
        let ledger = Arc::clone(&self.ledger);
        let reader = Arc::clone(&self.reader);
        let ids = self.ids.clone();
        let session = self.session.clone();

        tokio::spawn(async move {
            let Some(wallet) = session.signer() else {
                debug!("Change listener idle: no active signer");
                return;
            };

            let streams = register(ledger.as_ref(), &ids, wallet).await;
            if streams.is_empty() {
                warn!("Change listener has no transfer subscriptions for {}", wallet);
                return;
            }
            info!("Change listener watching {} tokens for {} ({} streams)", ids.len(), wallet, streams.len());

            let mut events = stream::select_all(streams);
            let mut reads = FuturesUnordered::new();
            let mut events_open = true;

            loop {
                tokio::select! {
                    event = events.next(), if events_open => {
                        let Some(event) = event else {
                            events_open = false;
                            if reads.is_empty() {
                                break;
                            }
                            continue;
                        };

                        let id = event.entity_id();
                        if !ids.contains(&id) {
                            continue;
                        }
                        debug!("Transfer on {} (block {:?}), re-reading", id, event.block_number);

                        let epoch = sink.current_epoch();
                        let reader = Arc::clone(&reader);
                        reads.push(async move { (epoch, id, reader.read(id).await) }.boxed());
                    }
                    Some((epoch, id, result)) = reads.next(), if !reads.is_empty() => {
                        match result {
                            Ok(value) => {
                                if !sink.emit_at(epoch, [(id, value)].into()).await {
                                    debug!("Change listener: pipeline closed");
                                    return;
                                }
                            }
                            Err(e) => log_read_failure("change_listener", &id, &e),
                        }
                        if !events_open && reads.is_empty() {
                            break;
                        }
                    }
                }
            }

            error!("Change listener for {} lost every transfer stream", wallet);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_sync::adapters::BalanceReader;
    use crate::data_sync::aggregator::Pipeline;
    use crate::data_sync::lifecycle::Lifecycle;
    use crate::data_sync::registry::CellMap;
    use crate::ledger::MockLedger;
    use alloy_primitives::U256;
    use std::time::Duration;

    fn token(byte: u8) -> EntityId {
        EntityId::new(1, Address::repeat_byte(byte))
    }

    fn wallet() -> Address {
        Address::repeat_byte(0x77)
    }

    fn listener_pipeline(ledger: &Arc<MockLedger>, session: &Session) -> Pipeline<U256> {
        let ids = vec![token(1), token(2)];
        let cells = Arc::new(CellMap::new("balances", ids.clone()));
        let reader = Arc::new(BalanceReader::new(ledger.clone(), session.clone()));
        Pipeline::new("balances", cells, Duration::from_millis(300), 16)
            .with_adapter(ChangeListener::new(ledger.clone(), reader, ids, session.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_reads_only_the_affected_entity() {
        let ledger = Arc::new(MockLedger::new());
        ledger.set_balance(token(2), U256::from(1000u64));
        let session = Session::new();
        session.set_signer(Some(wallet()));

        let pipeline = listener_pipeline(&ledger, &session);
        pipeline.subscribe();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ledger.transfer_listeners(), 4);

        assert_eq!(ledger.transfer_to(token(1), wallet(), U256::from(5u64)), 1);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(pipeline.cell(&token(1)).value(), Some(U256::from(5)));
        assert_eq!(pipeline.cell(&token(2)).value(), None);
        assert_eq!(ledger.balance_reads_for(token(1)), 1);
        assert_eq!(ledger.balance_reads_for(token(2)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_without_signer() {
        let ledger = Arc::new(MockLedger::new());
        let session = Session::new();

        let pipeline = listener_pipeline(&ledger, &session);
        pipeline.subscribe();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(ledger.transfer_listeners(), 0);
        assert_eq!(ledger.transfer_to(token(1), wallet(), U256::from(5u64)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_releases_listeners() {
        let ledger = Arc::new(MockLedger::new());
        let session = Session::new();
        session.set_signer(Some(wallet()));

        let pipeline = listener_pipeline(&ledger, &session);
        pipeline.subscribe();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ledger.transfer_listeners(), 4);

        pipeline.unsubscribe();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ledger.transfer_listeners(), 0);
    }
}
