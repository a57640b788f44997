/// Sync Monitor Example
///
/// Runs the synchronization service and prints every published balance, APR and
/// approval change.
///
/// With `LEDGER_SYNC_CONFIG` pointing at a TOML file the service talks to the configured
/// RPC endpoints; otherwise it runs against an in-memory ledger that simulates transfers.
use alloy_primitives::{Address, U256};
use eyre::Result;
use ledger_sync::data_sync::{NetworkConfig, ObserverHandle, PoolConfig};
use ledger_sync::utils::{SyncConfigLoaderSync, UNLIMITED_APPROVAL};
use ledger_sync::{
    Apr, ApproveRequest, EntityId, FeeSet, MockLedger, RegistryConfig, SyncConfig, SyncService, SyncServiceBuilder,
};
use std::sync::Arc;
use tokio::time::{Duration, sleep};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let signer = match std::env::var("LEDGER_SYNC_SIGNER") {
        Ok(raw) => raw.parse::<Address>().map_err(|e| eyre::eyre!("Invalid LEDGER_SYNC_SIGNER: {}", e))?,
        Err(_) => Address::repeat_byte(0x77),
    };

    match std::env::var("LEDGER_SYNC_CONFIG") {
        Ok(path) => run_live(path, signer).await,
        Err(_) => {
            warn!("LEDGER_SYNC_CONFIG not set, running against the in-memory ledger");
            run_simulated(signer).await
        }
    }
}

async fn run_live(path: String, signer: Address) -> Result<()> {
    let config = SyncConfig::load_section_from_file_sync(path.clone())?;
    let registry = RegistryConfig::load_section_from_file_sync(path)?;

    let service = SyncServiceBuilder::new().with_config(config).with_registry(registry).with_signer(signer).build()?;
    let _observers = watch(&service);
    service.start();

    sleep(Duration::from_secs(300)).await;
    print_stats(&service);
    service.stop();
    Ok(())
}

async fn run_simulated(signer: Address) -> Result<()> {
    let pool = Address::repeat_byte(0x10);
    let (token_a, token_b) = (Address::repeat_byte(0x01), Address::repeat_byte(0x02));
    let registry = RegistryConfig::new(vec![NetworkConfig {
        chain_id: 5000,
        name: "simulated".to_string(),
        rpc_http_url: "http://127.0.0.1:8545".to_string(),
        rpc_wss_url: None,
        multicall_address: None,
        spender: Some(Address::repeat_byte(0xee)),
        pools: vec![PoolConfig { address: pool, tokens: vec![token_a, token_b] }],
    }]);

    let (a, b, pool_id) = (EntityId::new(5000, token_a), EntityId::new(5000, token_b), EntityId::new(5000, pool));
    let ledger = Arc::new(MockLedger::new());
    ledger.set_balance(a, U256::from(10u64));
    ledger.set_balance(b, U256::from(1000u64));
    ledger.set_fees(pool_id, FeeSet { lp_fee_bps: 30, protocol_fee_bps: 5 });
    ledger.set_apr(pool_id, Apr(7.25));

    let service = SyncServiceBuilder::new()
        .with_config(SyncConfig::default())
        .with_registry(registry)
        .with_mock(Arc::clone(&ledger))
        .with_signer(signer)
        .build()?;
    let _observers = watch(&service);
    service.start();
    sleep(Duration::from_secs(1)).await;

    for (step, balance) in [5u64, 0, 42].into_iter().enumerate() {
        info!("Simulated transfer #{}: token A balance -> {}", step + 1, balance);
        ledger.transfer_to(a, signer, U256::from(balance));
        sleep(Duration::from_millis(800)).await;
    }

    let handle = service.request_approve(ApproveRequest { token: b, spender: None, amount: UNLIMITED_APPROVAL }).await?;
    handle.await?;
    sleep(Duration::from_millis(500)).await;
    info!("Status of approval on {}: {:?}", b, service.tx_status(&b).snapshot());

    ledger.set_apr(pool_id, Apr(-0.5));
    info!("Spot price moved above par, waiting for the next APR poll...");
    sleep(service.config().apr_poll_period() + Duration::from_secs(1)).await;

    print_stats(&service);
    service.stop();
    Ok(())
}

/// Log every change of the bulk snapshots and of each derived fact.
fn watch(service: &SyncService) -> Vec<ObserverHandle> {
    let mut handles = vec![
        service.balance_snapshots().on_change(|snapshot| {
            let total = snapshot.values().fold(U256::ZERO, |acc, balance| acc.saturating_add(*balance));
            info!("Balances published: {} tokens, total {}", snapshot.len(), total);
        }),
        service.apr_snapshots().on_change(|snapshot| {
            for (id, apr) in snapshot.iter() {
                info!("APR of {}: {}", id, apr);
            }
        }),
    ];

    for id in service.registry().token_ids() {
        handles.push(service.approval(&id).on_change(move |requirement| {
            info!("Approval requirement of {}: {:?}", id, requirement);
        }));
    }
    for id in service.registry().pool_ids() {
        handles.push(service.is_negative_interest(&id).on_change(move |negative| {
            if *negative == Some(true) {
                warn!("Pool {} now has negative interest", id);
            }
        }));
        handles.push(service.net_yield(&id).on_change(move |net| {
            info!("Net yield of {}: {:?}", id, net);
        }));
    }

    handles
}

fn print_stats(service: &SyncService) {
    for (name, stats) in service.stats() {
        info!(
            "{}: {} updates, {} stale, {} unknown, {} snapshots",
            name, stats.updates_received, stats.stale_dropped, stats.unknown_dropped, stats.snapshots_published
        );
    }
}
