/// Integration tests for the data synchronization layer
///
/// These tests drive a full `SyncService` against `MockLedger`, from bootstrap and
/// transfer notifications through aggregation to consumer bindings.

#[cfg(test)]
mod integration_tests {
    use super::super::*;
    use crate::data_sync::registry::tests::{address, network, pool};
    use crate::ledger::MockLedger;
    use crate::types::{Apr, ApprovalRequirement, EntityId, FeeSet, TxStatus};
    use alloy_primitives::{Address, U256};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Duration;

    fn wallet() -> Address {
        address(0x77)
    }

    fn token_a() -> EntityId {
        EntityId::new(1, address(0x01))
    }

    fn token_b() -> EntityId {
        EntityId::new(1, address(0x02))
    }

    fn pool_id() -> EntityId {
        EntityId::new(1, address(0x10))
    }

    fn service(ledger: &Arc<MockLedger>) -> SyncService {
        SyncServiceBuilder::new()
            .with_config(SyncConfig::default())
            .with_registry(RegistryConfig::new(vec![network(1, vec![pool(0x10, &[0x01, 0x02])])]))
            .with_mock(ledger.clone())
            .with_signer(wallet())
            .build()
            .unwrap()
    }

    fn seeded_ledger() -> Arc<MockLedger> {
        let ledger = Arc::new(MockLedger::new());
        ledger.set_balance(token_a(), U256::from(10u64));
        ledger.set_balance(token_b(), U256::from(1000u64));
        ledger.set_fees(pool_id(), FeeSet { lp_fee_bps: 30, protocol_fee_bps: 5 });
        ledger.set_apr(pool_id(), Apr(6.0));
        ledger
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_then_push_updates_snapshot() {
        let ledger = seeded_ledger();
        let service = service(&ledger);
        service.start();
        settle().await;

        let snapshot = service.balance_snapshots().snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[&token_a()], U256::from(10));
        assert_eq!(snapshot[&token_b()], U256::from(1000));
        // both bootstrap reads landed in one quiescence window
        assert_eq!(service.stats()["balances"].snapshots_published, 1);

        assert_eq!(ledger.transfer_to(token_a(), wallet(), U256::from(5u64)), 1);
        settle().await;

        let snapshot = service.balance_snapshots().snapshot();
        assert_eq!(snapshot[&token_a()], U256::from(5));
        assert_eq!(snapshot[&token_b()], U256::from(1000));
        assert_eq!(service.balance(&token_a()).snapshot(), Some(U256::from(5)));
        assert_eq!(ledger.balance_reads_for(token_b()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_entity_is_omitted_and_resolved_values_survive() {
        let ledger = seeded_ledger();
        ledger.fail(token_a());
        let service = service(&ledger);
        service.start();
        settle().await;

        let snapshot = service.balance_snapshots().snapshot();
        assert!(!snapshot.contains_key(&token_a()));
        assert_eq!(snapshot[&token_b()], U256::from(1000));
        assert_eq!(service.balance(&token_a()).snapshot(), None);

        // a later failure on B does not clear its published value
        ledger.fail(token_b());
        ledger.transfer_to(token_b(), wallet(), U256::from(1u64));
        settle().await;
        assert_eq!(service.balance(&token_b()).snapshot(), Some(U256::from(1000)));

        // recovery goes through the next notification
        ledger.recover(token_a());
        ledger.transfer_to(token_a(), wallet(), U256::from(7u64));
        settle().await;
        assert_eq!(service.balance(&token_a()).snapshot(), Some(U256::from(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_cells_without_resubscribing() {
        let ledger = seeded_ledger();
        let service = service(&ledger);
        service.start();
        settle().await;
        assert_eq!(service.fee(&pool_id()).snapshot(), Some(FeeSet { lp_fee_bps: 30, protocol_fee_bps: 5 }));
        assert!(service.net_yield(&pool_id()).snapshot().is_some());

        service.reset();
        assert_eq!(service.balance(&token_a()).snapshot(), None);
        assert_eq!(service.balance(&token_b()).snapshot(), None);
        assert_eq!(service.fee(&pool_id()).snapshot(), None);
        assert_eq!(service.apr(&pool_id()).snapshot(), None);
        assert!(service.balance_snapshots().snapshot().is_empty());
        assert!(service.balances().is_subscribed());

        // the running subscription keeps delivering after the reset
        ledger.transfer_to(token_a(), wallet(), U256::from(3u64));
        settle().await;
        assert_eq!(service.balance(&token_a()).snapshot(), Some(U256::from(3)));
        assert_eq!(service.balance(&token_b()).snapshot(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ignores_later_pushes() {
        let ledger = seeded_ledger();
        let service = service(&ledger);
        service.start();
        settle().await;
        let published = service.stats()["balances"].snapshots_published;

        service.stop();
        settle().await;
        assert_eq!(ledger.transfer_to(token_a(), wallet(), U256::from(5u64)), 0);
        settle().await;

        assert_eq!(service.stats()["balances"].snapshots_published, published);
        assert_eq!(service.balance(&token_a()).snapshot(), Some(U256::from(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_observers_share_one_read() {
        let ledger = seeded_ledger();
        let service = service(&ledger);
        let notified = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let notified = Arc::clone(&notified);
                service.balance(&token_a()).on_change(move |value| {
                    if value.is_some() {
                        notified.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        service.start();
        settle().await;

        assert_eq!(notified.load(Ordering::SeqCst), 50);
        assert_eq!(ledger.balance_reads_for(token_a()), 1);
        assert!(handles.iter().all(|handle| handle.is_active()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_read_leaves_entity_unresolved() {
        let ledger = seeded_ledger();
        ledger.hang(token_a());
        let service = service(&ledger);
        service.start();
        settle().await;

        assert_eq!(service.balance(&token_a()).snapshot(), None);
        assert_eq!(service.balance(&token_b()).snapshot(), Some(U256::from(1000)));
        assert_eq!(service.apr(&pool_id()).snapshot(), Some(Apr(6.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_balance_poll_continues_past_hung_token() {
        let ledger = seeded_ledger();
        ledger.hang(token_a());
        let service = service(&ledger);
        service.start();
        settle().await;
        assert_eq!(service.balance(&token_b()).snapshot(), Some(U256::from(1000)));

        // no push: only the poll can observe the new value
        ledger.set_balance(token_b(), U256::from(7u64));
        tokio::time::sleep(service.config().balance_poll_period()).await;
        settle().await;
        assert_eq!(service.balance(&token_b()).snapshot(), Some(U256::from(7)));

        ledger.set_balance(token_b(), U256::from(8u64));
        tokio::time::sleep(service.config().balance_poll_period()).await;
        assert_eq!(service.balance(&token_b()).snapshot(), Some(U256::from(8)));
        assert_eq!(service.balance(&token_a()).snapshot(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signer_switch_restarts_balances() {
        let ledger = seeded_ledger();
        let service = service(&ledger);
        service.start();
        settle().await;
        assert_eq!(ledger.balance_reads_for(token_a()), 1);

        assert!(service.set_signer(Some(address(0x78))));
        assert_eq!(service.balance(&token_a()).snapshot(), None);
        settle().await;

        assert_eq!(ledger.balance_reads_for(token_a()), 2);
        assert_eq!(service.balance(&token_a()).snapshot(), Some(U256::from(10)));
        assert!(!service.set_signer(Some(address(0x78))));

        service.set_signer(None);
        settle().await;
        assert_eq!(service.balance(&token_a()).snapshot(), None);
        assert_eq!(service.approval(&token_a()).snapshot(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_approval_flow() {
        let ledger = seeded_ledger();
        ledger.set_balance(token_a(), U256::from(0u64));
        ledger.set_allowance(token_b(), U256::from(1000u64));
        let service = service(&ledger);
        service.start();
        settle().await;

        assert_eq!(service.approval(&token_a()).snapshot(), Some(ApprovalRequirement::AlwaysApproved));
        assert_eq!(
            service.approval(&token_b()).snapshot(),
            Some(ApprovalRequirement::Required { approved: false, amount: U256::from(1000) })
        );
        assert_eq!(ledger.allowance_reads(), 1);

        let handle = service
            .request_approve(ApproveRequest { token: token_b(), spender: None, amount: U256::MAX })
            .await
            .unwrap();
        handle.await.unwrap();
        settle().await;

        assert!(matches!(service.tx_status(&token_b()).snapshot(), Some(TxStatus::Confirmed(_))));
        assert_eq!(
            service.approval(&token_b()).snapshot(),
            Some(ApprovalRequirement::Required { approved: true, amount: U256::MAX })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_interest_follows_apr() {
        let ledger = seeded_ledger();
        ledger.set_apr(pool_id(), Apr(-2.0));
        let service = service(&ledger);
        service.start();
        settle().await;

        assert_eq!(service.is_negative_interest(&pool_id()).snapshot(), Some(true));
        let net = service.net_yield(&pool_id()).snapshot().unwrap();
        assert!((net.0 - (-2.35)).abs() < 1e-9);
    }
}
