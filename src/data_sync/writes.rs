use super::aggregator::{Pipeline, UpdateSink};
use super::derived::DerivedChain;
use super::registry::EntityRegistry;
use crate::error::{SyncError, SyncResult};
use crate::ledger::TxSubmitter;
use crate::types::{ApprovalRequirement, EntityId, TxHash, TxStatus};
use alloy_primitives::{Address, U256};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApproveRequest {
    pub token: EntityId,
    /// Defaults to the spender configured for the token's network.
    pub spender: Option<Address>,
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositRequest {
    pub pool: EntityId,
    pub amount: U256,
}

/// Remote mutations whose progress is published through the tx status pipeline.
#[derive(Clone)]
pub struct WriteTriggers {
    registry: Arc<EntityRegistry>,
    submitter: Arc<dyn TxSubmitter>,
    statuses: Arc<Pipeline<TxStatus>>,
    approvals: Arc<DerivedChain<ApprovalRequirement>>,
}

impl WriteTriggers {
    pub fn new(
        registry: Arc<EntityRegistry>,
        submitter: Arc<dyn TxSubmitter>,
        statuses: Arc<Pipeline<TxStatus>>,
        approvals: Arc<DerivedChain<ApprovalRequirement>>,
    ) -> Self {
        Self { registry, submitter, statuses, approvals }
    }

    fn status_sink(&self, target: &EntityId) -> SyncResult<UpdateSink<TxStatus>> {
        if !self.statuses.cells().contains(target) {
            return Err(SyncError::UnknownEntity(*target));
        }
        self.statuses.sink().ok_or(SyncError::NotSubscribed("tx_statuses"))
    }

    /// Submit an approval. `Pending` is emitted before this returns; the handle
    /// completes once the final status has been emitted.
    pub async fn request_approve(&self, request: ApproveRequest) -> SyncResult<JoinHandle<()>> {
        let target = request.token;
        let sink = self.status_sink(&target)?;
        let spender = request
            .spender
            .or_else(|| self.registry.spender(target.network))
            .ok_or(SyncError::NoSpender(target.network))?;

        publish_status(&sink, target, TxStatus::Pending).await;
        info!("Approve of {} for {} submitted", target, spender);

        let submitter = Arc::clone(&self.submitter);
        let approvals = Arc::clone(&self.approvals);
        Ok(tokio::spawn(async move {
            let result = submitter.approve(target.network, target.address, spender, request.amount).await;
            let confirmed = result.is_ok();
            publish_status(&sink, target, final_status("approve", &target, result)).await;
            if confirmed {
                approvals.refresh(&target);
            }
        }))
    }

    pub async fn request_deposit(&self, request: DepositRequest) -> SyncResult<JoinHandle<()>> {
        let target = request.pool;
        let sink = self.status_sink(&target)?;

        publish_status(&sink, target, TxStatus::Pending).await;
        info!("Deposit of {} into {} submitted", request.amount, target);

        let submitter = Arc::clone(&self.submitter);
        Ok(tokio::spawn(async move {
            let result = submitter.deposit(target.network, target.address, request.amount).await;
            publish_status(&sink, target, final_status("deposit", &target, result)).await;
        }))
    }
}

async fn publish_status(sink: &UpdateSink<TxStatus>, target: EntityId, status: TxStatus) {
    if !sink.emit_one(target, status.clone()).await {
        warn!("Tx status pipeline closed, dropping {:?} for {}", status, target);
    }
}

fn final_status(action: &str, target: &EntityId, result: SyncResult<TxHash>) -> TxStatus {
    match result {
        Ok(hash) => {
            info!("{} on {} confirmed: {}", action, target, hash);
            TxStatus::Confirmed(hash)
        }
        Err(e) => {
            warn!("{} on {} failed: {}", action, target, e);
            TxStatus::Failed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_sync::derived::approval_requirements;
    use crate::data_sync::lifecycle::Lifecycle;
    use crate::data_sync::network_config::RegistryConfig;
    use crate::data_sync::registry::tests::{address, network, pool};
    use crate::data_sync::session::Session;
    use crate::ledger::{MockLedger, ReadOnly};
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Fixture {
        ledger: Arc<MockLedger>,
        statuses: Arc<Pipeline<TxStatus>>,
        triggers: WriteTriggers,
    }

    fn fixture(submitter: Option<Arc<dyn TxSubmitter>>) -> Fixture {
        let config = RegistryConfig::new(vec![network(1, vec![pool(0x10, &[0x01])])]);
        let registry = Arc::new(EntityRegistry::from_config(&config).unwrap());
        let ledger = Arc::new(MockLedger::new());
        let session = Session::new();
        let statuses = Arc::new(Pipeline::new(
            "tx_statuses",
            Arc::clone(registry.tx_statuses()),
            Duration::from_millis(50),
            16,
        ));
        let approvals = Arc::new(approval_requirements(&registry, &session, ledger.clone()));
        let submitter = submitter.unwrap_or_else(|| ledger.clone() as Arc<dyn TxSubmitter>);
        let triggers = WriteTriggers::new(registry, submitter, Arc::clone(&statuses), approvals);
        Fixture { ledger, statuses, triggers }
    }

    fn token() -> EntityId {
        EntityId::new(1, address(0x01))
    }

    #[tokio::test(start_paused = true)]
    async fn test_approve_publishes_pending_then_confirmed() {
        let f = fixture(None);
        f.statuses.subscribe();
        // slow submission so Pending gets its own quiescence window
        f.ledger.set_read_delay(Duration::from_secs(1));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = {
            let seen = Arc::clone(&seen);
            f.statuses.cell(&token()).binding().on_change(move |status| seen.lock().push(status.clone()))
        };

        let handle = f
            .triggers
            .request_approve(ApproveRequest { token: token(), spender: None, amount: U256::from(100) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(f.statuses.cell(&token()).value(), Some(TxStatus::Pending));

        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], Some(TxStatus::Pending));
        assert!(matches!(seen[1], Some(TxStatus::Confirmed(_))));
        assert_eq!(f.ledger.writes(), 1);
        assert!(recorder.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_after_unsubscribe_is_dropped() {
        let f = fixture(None);
        f.statuses.subscribe();
        f.ledger.set_read_delay(Duration::from_secs(1));

        let handle = f
            .triggers
            .request_deposit(DepositRequest { pool: EntityId::new(1, address(0x10)), amount: U256::from(1) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        f.statuses.unsubscribe();

        // the submit task still finishes once the sink is closed
        handle.await.unwrap();
        assert_eq!(f.statuses.cell(&EntityId::new(1, address(0x10))).value(), Some(TxStatus::Pending));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_deposit_publishes_reason() {
        let f = fixture(None);
        f.statuses.subscribe();
        f.ledger.set_fail_writes(true);
        let pool_id = EntityId::new(1, address(0x10));

        f.triggers.request_deposit(DepositRequest { pool: pool_id, amount: U256::from(1) }).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        match f.statuses.cell(&pool_id).value() {
            Some(TxStatus::Failed(reason)) => assert!(reason.contains("deposit rejected")),
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_requests() {
        let f = fixture(Some(Arc::new(ReadOnly)));
        let request = DepositRequest { pool: EntityId::new(1, address(0x10)), amount: U256::from(1) };
        assert!(matches!(
            f.triggers.request_deposit(request.clone()).await,
            Err(SyncError::NotSubscribed(_))
        ));

        f.statuses.subscribe();
        let stranger = DepositRequest { pool: EntityId::new(9, address(0x10)), amount: U256::from(1) };
        assert!(matches!(f.triggers.request_deposit(stranger).await, Err(SyncError::UnknownEntity(_))));

        f.triggers.request_deposit(request.clone()).await.unwrap().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(matches!(f.statuses.cell(&request.pool).value(), Some(TxStatus::Failed(_))));
    }
}
