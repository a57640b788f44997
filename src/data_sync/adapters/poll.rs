use super::{EntityReader, SourceAdapter, log_read_failure};
use crate::data_sync::aggregator::UpdateSink;
use crate::data_sync::session::Session;
use crate::types::{CellValue, EntityId};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Entities re-read on every poll tick.
#[derive(Debug, Clone)]
pub enum Cohort {
    All(Vec<EntityId>),
    /// Only entities on the session's active network. Every entity when none is selected.
    ActiveNetwork { ids: Vec<EntityId>, session: Session },
}

impl Cohort {
    pub fn members(&self) -> Vec<EntityId> {
        match self {
            Cohort::All(ids) => ids.clone(),
            Cohort::ActiveNetwork { ids, session } => match session.active_network() {
                Some(network) => ids.iter().filter(|id| id.network == network).copied().collect(),
                None => ids.clone(),
            },
        }
    }
}

pub struct IntervalPoll<T> {
    reader: Arc<dyn EntityReader<T>>,
    cohort: Cohort,
    period: Duration,
}

impl<T: CellValue> IntervalPoll<T> {
    pub fn new(reader: Arc<dyn EntityReader<T>>, cohort: Cohort, period: Duration) -> Self {
        Self { reader, cohort, period }
    }
}

impl<T: CellValue> SourceAdapter<T> for IntervalPoll<T> {
    fn name(&self) -> &'static str {
        "interval_poll"
    }

    fn spawn(&self, sink: UpdateSink<T>) -> JoinHandle<()> {
        let reader = Arc::clone(&self.reader);
        let cohort = self.cohort.clone();
        let period = self.period;

        tokio::spawn(async move {
            info!("Interval poll started every {:?}", period);
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately and bootstrap already covers it
            interval.tick().await;

            // reads still outstanding from an earlier tick are not issued again
            let mut in_flight: HashSet<EntityId> = HashSet::new();
            let mut reads = FuturesUnordered::new();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let epoch = sink.current_epoch();
                        let members = cohort.members();
                        let mut issued = 0usize;
                        for id in members.iter().copied() {
                            if !in_flight.insert(id) {
                                continue;
                            }
                            let reader = Arc::clone(&reader);
                            reads.push(async move { (id, epoch, reader.read(id).await) });
                            issued += 1;
                        }
                        debug!("Poll tick issued {}/{} reads", issued, members.len());
                    }

                    Some((id, epoch, result)) = reads.next(), if !reads.is_empty() => {
                        in_flight.remove(&id);
                        match result {
                            Ok(value) => {
                                if !sink.emit_at(epoch, [(id, value)].into()).await {
                                    debug!("Interval poll: pipeline closed");
                                    return;
                                }
                            }
                            Err(e) => log_read_failure("interval_poll", &id, &e),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_sync::adapters::{AprReader, FeeReader};
    use crate::data_sync::aggregator::Pipeline;
    use crate::data_sync::lifecycle::Lifecycle;
    use crate::data_sync::registry::CellMap;
    use crate::ledger::MockLedger;
    use crate::types::{Apr, FeeSet, NetworkId};
    use alloy_primitives::Address;

    #[test]
    fn test_active_network_cohort() {
        let a = EntityId::new(1, Address::repeat_byte(0x01));
        let b = EntityId::new(2, Address::repeat_byte(0x02));
        let session = Session::new();
        let cohort = Cohort::ActiveNetwork { ids: vec![a, b], session: session.clone() };

        assert_eq!(cohort.members(), vec![a, b]);
        session.set_active_network(Some(NetworkId(2)));
        assert_eq!(cohort.members(), vec![b]);
        assert_eq!(Cohort::All(vec![a, b]).members().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_skips_first_tick_then_rereads() {
        let ledger = Arc::new(MockLedger::new());
        let pool = EntityId::new(1, Address::repeat_byte(0x0a));
        ledger.set_apr(pool, Apr(4.0));

        let cells = Arc::new(CellMap::new("aprs", [pool]));
        let pipeline = Pipeline::new("aprs", cells, Duration::from_millis(100), 16).with_adapter(IntervalPoll::new(
            Arc::new(AprReader::new(ledger.clone())),
            Cohort::All(vec![pool]),
            Duration::from_secs(60),
        ));

        pipeline.subscribe();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ledger.apr_reads(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ledger.apr_reads(), 1);
        assert_eq!(pipeline.cell(&pool).value(), Some(Apr(4.0)));

        ledger.set_apr(pool, Apr(-1.5));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ledger.apr_reads(), 2);
        assert_eq!(pipeline.cell(&pool).value(), Some(Apr(-1.5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_faulty_members_do_not_stall_the_cohort() {
        let ledger = Arc::new(MockLedger::new());
        let (failing, hanging, healthy) = (
            EntityId::new(1, Address::repeat_byte(0x01)),
            EntityId::new(1, Address::repeat_byte(0x02)),
            EntityId::new(1, Address::repeat_byte(0x03)),
        );
        let fees = |bps| FeeSet { lp_fee_bps: bps, protocol_fee_bps: 0 };
        ledger.fail(failing);
        ledger.hang(hanging);
        ledger.set_fees(healthy, fees(30));

        let ids = vec![failing, hanging, healthy];
        let cells = Arc::new(CellMap::new("fees", ids.clone()));
        let pipeline = Pipeline::new("fees", cells, Duration::from_millis(100), 16).with_adapter(IntervalPoll::new(
            Arc::new(FeeReader::new(ledger.clone())),
            Cohort::All(ids),
            Duration::from_secs(60),
        ));

        pipeline.subscribe();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(pipeline.cell(&healthy).value(), Some(fees(30)));
        assert_eq!(ledger.fee_reads(), 3);

        ledger.set_fees(healthy, fees(40));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(pipeline.cell(&healthy).value(), Some(fees(40)));
        // the hung read is still outstanding and is not issued again
        assert_eq!(ledger.fee_reads(), 5);

        ledger.set_fees(healthy, fees(50));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(pipeline.cell(&healthy).value(), Some(fees(50)));
        assert_eq!(pipeline.cell(&failing).value(), None);
        assert_eq!(pipeline.cell(&hanging).value(), None);
    }
}
