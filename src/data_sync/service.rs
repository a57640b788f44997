use crate::data_sync::{
    adapters::{AprReader, BalanceReader, BootstrapFetch, ChangeListener, Cohort, EntityReader, FeeReader, IntervalPoll},
    aggregator::{Pipeline, PipelineStats},
    binding::Binding,
    config::SyncConfig,
    derived::{self, DerivedChain},
    lifecycle::Lifecycle,
    network_config::RegistryConfig,
    registry::EntityRegistry,
    session::Session,
    writes::{ApproveRequest, DepositRequest, WriteTriggers},
};
use crate::error::{SyncError, SyncResult};
use crate::ledger::{LedgerClient, MockLedger, ReadOnly, RpcLedgerClient, TransferWatcher, TxSubmitter};
use crate::types::{Apr, ApprovalRequirement, EntityId, FeeSet, NetworkId, SnapshotMap, TxStatus};
use alloy_primitives::{Address, U256};
use eyre::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Main data synchronization service
///
/// Owns the entity registry, one pipeline per fetched fact, the derived chains and the
/// write triggers, all wired to the same ledger client and session.
pub struct SyncService {
    config: SyncConfig,
    registry: Arc<EntityRegistry>,
    session: Session,

    balances: Arc<Pipeline<U256>>,
    fees: Arc<Pipeline<FeeSet>>,
    aprs: Arc<Pipeline<Apr>>,
    tx_statuses: Arc<Pipeline<TxStatus>>,

    approvals: Arc<DerivedChain<ApprovalRequirement>>,
    negative_interest: Arc<DerivedChain<bool>>,
    net_yields: Arc<DerivedChain<Apr>>,

    writes: WriteTriggers,
    running: AtomicBool,
}

impl SyncService {
    pub fn new(
        config: SyncConfig,
        registry_config: &RegistryConfig,
        ledger: Arc<dyn LedgerClient>,
        submitter: Arc<dyn TxSubmitter>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(EntityRegistry::from_config(registry_config)?);
        let session = Session::new();
        let buffer = config.channel_buffer_size;

        let balance_reader: Arc<dyn EntityReader<U256>> = Arc::new(BalanceReader::new(Arc::clone(&ledger), session.clone()));
        let token_ids = registry.token_ids();
        let balances = Pipeline::new("balances", Arc::clone(registry.balances()), config.balance_quiescence(), buffer)
            .with_adapter(BootstrapFetch::new(Arc::clone(&balance_reader), token_ids.clone(), Arc::clone(registry.balances())))
            .with_adapter(ChangeListener::new(
                Arc::clone(&ledger),
                Arc::clone(&balance_reader),
                token_ids.clone(),
                session.clone(),
            ))
            .with_adapter(IntervalPoll::new(
                balance_reader,
                Cohort::ActiveNetwork { ids: token_ids, session: session.clone() },
                config.balance_poll_period(),
            ));

        let pool_ids = registry.pool_ids();
        let fee_reader: Arc<dyn EntityReader<FeeSet>> = Arc::new(FeeReader::new(Arc::clone(&ledger)));
        let fees = Pipeline::new("fees", Arc::clone(registry.fees()), config.fee_quiescence(), buffer)
            .with_adapter(BootstrapFetch::new(Arc::clone(&fee_reader), pool_ids.clone(), Arc::clone(registry.fees())))
            .with_adapter(IntervalPoll::new(fee_reader, Cohort::All(pool_ids.clone()), config.fee_poll_period()));

        let apr_reader: Arc<dyn EntityReader<Apr>> = Arc::new(AprReader::new(Arc::clone(&ledger)));
        let aprs = Pipeline::new("aprs", Arc::clone(registry.aprs()), config.apr_quiescence(), buffer)
            .with_adapter(BootstrapFetch::new(Arc::clone(&apr_reader), pool_ids.clone(), Arc::clone(registry.aprs())))
            .with_adapter(IntervalPoll::new(
                apr_reader,
                Cohort::ActiveNetwork { ids: pool_ids, session: session.clone() },
                config.apr_poll_period(),
            ));

        let tx_statuses = Arc::new(Pipeline::new(
            "tx_statuses",
            Arc::clone(registry.tx_statuses()),
            config.tx_status_quiescence(),
            buffer,
        ));

        let approvals = Arc::new(derived::approval_requirements(&registry, &session, Arc::clone(&ledger)));
        let negative_interest = Arc::new(derived::negative_interest(&registry));
        let net_yields = Arc::new(derived::net_yields(&registry));

        let writes = WriteTriggers::new(Arc::clone(&registry), submitter, Arc::clone(&tx_statuses), Arc::clone(&approvals));

        info!(
            "SyncService initialized: {} tokens, {} pools",
            registry.balances().len(),
            registry.fees().len()
        );

        Ok(Self {
            config,
            registry,
            session,
            balances: Arc::new(balances),
            fees: Arc::new(fees),
            aprs: Arc::new(aprs),
            tx_statuses,
            approvals,
            negative_interest,
            net_yields,
            writes,
            running: AtomicBool::new(false),
        })
    }

    /// Service backed by JSON-RPC endpoints of every configured network. Writes are
    /// disabled since no signing backend is attached.
    pub fn connect(config: SyncConfig, registry_config: &RegistryConfig) -> Result<Self> {
        let watcher = TransferWatcher::from_config(&config);
        let client = RpcLedgerClient::new(config.http_timeout(), watcher)?;
        for network in &registry_config.networks {
            client.register_network(network.network_id(), network.endpoint());
        }
        Self::new(config, registry_config, Arc::new(client), Arc::new(ReadOnly))
    }

    fn lifecycles(&self) -> [&dyn Lifecycle; 7] {
        [
            &*self.tx_statuses,
            &*self.balances,
            &*self.fees,
            &*self.aprs,
            &*self.approvals,
            &*self.negative_interest,
            &*self.net_yields,
        ]
    }

    pub fn start(&self) {
        info!("Starting SyncService");
        for lifecycle in self.lifecycles() {
            lifecycle.subscribe();
        }
        self.running.store(true, Ordering::SeqCst);
        info!("SyncService started");
    }

    pub fn stop(&self) {
        info!("Stopping SyncService");
        for lifecycle in self.lifecycles().into_iter().rev() {
            lifecycle.unsubscribe();
        }
        self.running.store(false, Ordering::SeqCst);
        info!("SyncService stopped");
    }

    /// Clear every fact without touching subscriptions.
    pub fn reset(&self) {
        for lifecycle in self.lifecycles() {
            lifecycle.reset();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Switch wallets. Balances and approvals belong to the previous signer, so they are
    /// cleared and their subscriptions restarted.
    pub fn set_signer(&self, signer: Option<Address>) -> bool {
        if !self.session.set_signer(signer) {
            return false;
        }

        self.balances.reset();
        self.approvals.reset();
        if self.is_running() {
            self.balances.subscribe();
            self.approvals.subscribe();
        }
        true
    }

    /// Select the network polled for balances and APR.
    pub fn set_network(&self, network: Option<NetworkId>) -> SyncResult<bool> {
        if let Some(unknown) = network.filter(|network| self.registry.network(*network).is_none()) {
            return Err(SyncError::ServiceUnavailable(unknown));
        }
        Ok(self.session.set_active_network(network))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn balance(&self, token: &EntityId) -> Binding<Option<U256>> {
        self.balances.cell(token).binding()
    }

    pub fn fee(&self, pool: &EntityId) -> Binding<Option<FeeSet>> {
        self.fees.cell(pool).binding()
    }

    pub fn apr(&self, pool: &EntityId) -> Binding<Option<Apr>> {
        self.aprs.cell(pool).binding()
    }

    pub fn approval(&self, token: &EntityId) -> Binding<Option<ApprovalRequirement>> {
        self.approvals.cell(token).binding()
    }

    pub fn is_negative_interest(&self, pool: &EntityId) -> Binding<Option<bool>> {
        self.negative_interest.cell(pool).binding()
    }

    pub fn net_yield(&self, pool: &EntityId) -> Binding<Option<Apr>> {
        self.net_yields.cell(pool).binding()
    }

    pub fn tx_status(&self, target: &EntityId) -> Binding<Option<TxStatus>> {
        self.tx_statuses.cell(target).binding()
    }

    pub fn balance_snapshots(&self) -> Binding<Arc<SnapshotMap<U256>>> {
        self.balances.binding()
    }

    pub fn fee_snapshots(&self) -> Binding<Arc<SnapshotMap<FeeSet>>> {
        self.fees.binding()
    }

    pub fn apr_snapshots(&self) -> Binding<Arc<SnapshotMap<Apr>>> {
        self.aprs.binding()
    }

    pub fn balances(&self) -> &Pipeline<U256> {
        &self.balances
    }

    pub fn fees(&self) -> &Pipeline<FeeSet> {
        &self.fees
    }

    pub fn aprs(&self) -> &Pipeline<Apr> {
        &self.aprs
    }

    pub fn approvals(&self) -> &DerivedChain<ApprovalRequirement> {
        &self.approvals
    }

    pub async fn request_approve(&self, request: ApproveRequest) -> SyncResult<JoinHandle<()>> {
        self.writes.request_approve(request).await
    }

    pub async fn request_deposit(&self, request: DepositRequest) -> SyncResult<JoinHandle<()>> {
        self.writes.request_deposit(request).await
    }

    pub fn stats(&self) -> BTreeMap<&'static str, PipelineStats> {
        BTreeMap::from([
            (self.balances.name(), self.balances.stats()),
            (self.fees.name(), self.fees.stats()),
            (self.aprs.name(), self.aprs.stats()),
            (self.tx_statuses.name(), self.tx_statuses.stats()),
        ])
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("SyncService dropped while running, aborting subscriptions");
        }
    }
}

/// Builder for SyncService to make creation more ergonomic
#[derive(Default)]
pub struct SyncServiceBuilder {
    config: Option<SyncConfig>,
    registry: Option<RegistryConfig>,
    ledger: Option<Arc<dyn LedgerClient>>,
    submitter: Option<Arc<dyn TxSubmitter>>,
    signer: Option<Address>,
    network: Option<NetworkId>,
}

impl SyncServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn LedgerClient>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_submitter(mut self, submitter: Arc<dyn TxSubmitter>) -> Self {
        self.submitter = Some(submitter);
        self
    }

    /// Use one in-memory ledger for both reads and writes.
    pub fn with_mock(self, mock: Arc<MockLedger>) -> Self {
        self.with_ledger(mock.clone()).with_submitter(mock)
    }

    pub fn with_signer(mut self, signer: Address) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_network(mut self, network: NetworkId) -> Self {
        self.network = Some(network);
        self
    }

    pub fn build(self) -> Result<SyncService> {
        let config = self.config.unwrap_or_else(|| SyncConfig::from_env().unwrap_or_default());
        let registry = self.registry.ok_or_else(|| eyre::eyre!("SyncServiceBuilder requires a registry config"))?;

        let service = match self.ledger {
            Some(ledger) => {
                let submitter = self.submitter.unwrap_or_else(|| Arc::new(ReadOnly) as Arc<dyn TxSubmitter>);
                SyncService::new(config, &registry, ledger, submitter)?
            }
            None => SyncService::connect(config, &registry)?,
        };

        service.set_signer(self.signer);
        service.set_network(self.network)?;
        Ok(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_sync::registry::tests::{address, network, pool};

    fn registry_config() -> RegistryConfig {
        RegistryConfig::new(vec![
            network(1, vec![pool(0x10, &[0x01, 0x02])]),
            network(5000, vec![pool(0x20, &[0x03])]),
        ])
    }

    #[tokio::test]
    async fn test_service_creation() {
        let service = SyncServiceBuilder::new()
            .with_config(SyncConfig::default())
            .with_registry(registry_config())
            .with_mock(Arc::new(MockLedger::new()))
            .build()
            .unwrap();

        assert!(!service.is_running());
        assert_eq!(service.registry().token_ids().len(), 3);
        assert_eq!(service.stats().len(), 4);
        assert_eq!(service.balances().adapter_names(), vec!["bootstrap", "change_listener", "interval_poll"]);
        assert_eq!(service.fees().adapter_names(), vec!["bootstrap", "interval_poll"]);
    }

    #[tokio::test]
    async fn test_builder_requires_registry() {
        assert!(SyncServiceBuilder::new().with_mock(Arc::new(MockLedger::new())).build().is_err());
    }

    #[tokio::test]
    async fn test_connect_registers_every_network() {
        let service = SyncService::connect(SyncConfig::default(), &registry_config()).unwrap();
        assert_eq!(service.registry().networks().count(), 2);

        let pool_id = EntityId::new(1, address(0x10));
        let request = DepositRequest { pool: pool_id, amount: U256::from(1) };
        // status pipeline is not running yet
        assert!(matches!(service.request_deposit(request).await, Err(SyncError::NotSubscribed(_))));
    }

    #[tokio::test]
    async fn test_set_network_rejects_unknown_network() {
        let service = SyncServiceBuilder::new()
            .with_registry(registry_config())
            .with_mock(Arc::new(MockLedger::new()))
            .build()
            .unwrap();

        assert!(service.set_network(Some(NetworkId(5000))).unwrap());
        assert!(!service.set_network(Some(NetworkId(5000))).unwrap());
        assert!(matches!(service.set_network(Some(NetworkId(42))), Err(SyncError::ServiceUnavailable(_))));
        assert_eq!(service.session().active_network(), Some(NetworkId(5000)));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let service = SyncServiceBuilder::new()
            .with_registry(registry_config())
            .with_mock(Arc::new(MockLedger::new()))
            .with_signer(address(0x77))
            .build()
            .unwrap();

        service.start();
        assert!(service.is_running());
        assert!(service.balances().is_subscribed());
        assert!(service.approvals().is_subscribed());

        service.stop();
        assert!(!service.is_running());
        assert!(!service.balances().is_subscribed());
    }
}
