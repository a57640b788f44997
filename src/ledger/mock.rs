use super::{LedgerClient, TxSubmitter};
use crate::error::{SyncError, SyncResult};
use crate::types::{Apr, EntityId, FeeSet, NetworkId, TransferEvent, TxHash};
use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

struct TransferListener {
    entity: EntityId,
    from: Option<Address>,
    to: Option<Address>,
    tx: mpsc::Sender<TransferEvent>,
}

impl TransferListener {
    fn matches(&self, event: &TransferEvent) -> bool {
        self.entity == event.entity_id()
            && self.from.is_none_or(|from| from == event.from)
            && self.to.is_none_or(|to| to == event.to)
    }
}

/// In-memory ledger with scripted values, failures and read counters.
///
/// Balances are tracked for a single wallet: the wallet argument of balance reads is
/// ignored.
#[derive(Default)]
pub struct MockLedger {
    balances: DashMap<EntityId, U256>,
    allowances: DashMap<EntityId, U256>,
    fees: DashMap<EntityId, FeeSet>,
    aprs: DashMap<EntityId, Apr>,

    failing: DashSet<EntityId>,
    hanging: DashSet<EntityId>,
    unavailable_networks: DashSet<NetworkId>,
    read_delay: Mutex<Option<Duration>>,

    balance_reads: AtomicUsize,
    balance_reads_by_entity: DashMap<EntityId, usize>,
    allowance_reads: AtomicUsize,
    fee_reads: AtomicUsize,
    apr_reads: AtomicUsize,

    listeners: Mutex<Vec<TransferListener>>,

    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, entity: EntityId, balance: impl Into<U256>) {
        self.balances.insert(entity, balance.into());
    }

    pub fn set_allowance(&self, entity: EntityId, allowance: impl Into<U256>) {
        self.allowances.insert(entity, allowance.into());
    }

    pub fn set_fees(&self, entity: EntityId, fees: FeeSet) {
        self.fees.insert(entity, fees);
    }

    pub fn set_apr(&self, entity: EntityId, apr: Apr) {
        self.aprs.insert(entity, apr);
    }

    /// Every read for `entity` fails until `recover` is called.
    pub fn fail(&self, entity: EntityId) {
        self.failing.insert(entity);
    }

    pub fn recover(&self, entity: EntityId) {
        self.failing.remove(&entity);
        self.hanging.remove(&entity);
    }

    /// Every read for `entity` never resolves.
    pub fn hang(&self, entity: EntityId) {
        self.hanging.insert(entity);
    }

    pub fn set_network_unavailable(&self, network: NetworkId) {
        self.unavailable_networks.insert(network);
    }

    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock() = Some(delay);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn balance_reads(&self) -> usize {
        self.balance_reads.load(Ordering::SeqCst)
    }

    pub fn balance_reads_for(&self, entity: EntityId) -> usize {
        self.balance_reads_by_entity.get(&entity).map(|count| *count).unwrap_or(0)
    }

    pub fn allowance_reads(&self) -> usize {
        self.allowance_reads.load(Ordering::SeqCst)
    }

    pub fn fee_reads(&self) -> usize {
        self.fee_reads.load(Ordering::SeqCst)
    }

    pub fn apr_reads(&self) -> usize {
        self.apr_reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn transfer_listeners(&self) -> usize {
        let mut listeners = self.listeners.lock();
        listeners.retain(|listener| !listener.tx.is_closed());
        listeners.len()
    }

    /// Deliver a transfer notification to every matching listener.
    pub fn push_transfer(&self, event: TransferEvent) -> usize {
        let mut listeners = self.listeners.lock();
        listeners.retain(|listener| !listener.tx.is_closed());
        listeners
            .iter()
            .filter(|listener| listener.matches(&event))
            .filter(|listener| listener.tx.try_send(event.clone()).is_ok())
            .count()
    }

    /// Change a balance and notify listeners as if `wallet` had received or sent tokens.
    pub fn transfer_to(&self, entity: EntityId, wallet: Address, new_balance: impl Into<U256>) -> usize {
        let new_balance = new_balance.into();
        self.set_balance(entity, new_balance);
        self.push_transfer(TransferEvent {
            network: entity.network,
            token: entity.address,
            from: Address::ZERO,
            to: wallet,
            value: new_balance,
            block_number: None,
        })
    }

    async fn before_read(&self, entity: EntityId) -> SyncResult<()> {
        if self.unavailable_networks.contains(&entity.network) {
            return Err(SyncError::ServiceUnavailable(entity.network));
        }
        let delay = *self.read_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.hanging.contains(&entity) {
            std::future::pending::<()>().await;
        }
        if self.failing.contains(&entity) {
            return Err(SyncError::remote_read(entity, "scripted failure"));
        }
        Ok(())
    }

    fn next_tx_hash(&self) -> TxHash {
        let count = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        B256::left_padding_from(&(count as u64).to_be_bytes())
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn read_balance(&self, network: NetworkId, token: Address, _wallet: Address) -> SyncResult<U256> {
        let entity = EntityId::new(network, token);
        self.balance_reads.fetch_add(1, Ordering::SeqCst);
        *self.balance_reads_by_entity.entry(entity).or_insert(0) += 1;
        self.before_read(entity).await?;
        self.balances.get(&entity).map(|balance| *balance).ok_or_else(|| SyncError::remote_read(entity, "no balance"))
    }

    async fn read_allowance(
        &self,
        network: NetworkId,
        token: Address,
        _wallet: Address,
        _spender: Address,
    ) -> SyncResult<U256> {
        let entity = EntityId::new(network, token);
        self.allowance_reads.fetch_add(1, Ordering::SeqCst);
        self.before_read(entity).await?;
        Ok(self.allowances.get(&entity).map(|allowance| *allowance).unwrap_or(U256::ZERO))
    }

    async fn on_transfer(
        &self,
        network: NetworkId,
        token: Address,
        from_filter: Option<Address>,
        to_filter: Option<Address>,
    ) -> SyncResult<mpsc::Receiver<TransferEvent>> {
        if self.unavailable_networks.contains(&network) {
            return Err(SyncError::ServiceUnavailable(network));
        }
        let (tx, rx) = mpsc::channel(64);
        self.listeners.lock().push(TransferListener {
            entity: EntityId::new(network, token),
            from: from_filter,
            to: to_filter,
            tx,
        });
        Ok(rx)
    }

    async fn read_fee_config(&self, network: NetworkId, pool: Address) -> SyncResult<FeeSet> {
        let entity = EntityId::new(network, pool);
        self.fee_reads.fetch_add(1, Ordering::SeqCst);
        self.before_read(entity).await?;
        self.fees.get(&entity).map(|fees| *fees).ok_or_else(|| SyncError::remote_read(entity, "no fee config"))
    }

    async fn read_spot_derived_apr(&self, network: NetworkId, pool: Address) -> SyncResult<Apr> {
        let entity = EntityId::new(network, pool);
        self.apr_reads.fetch_add(1, Ordering::SeqCst);
        self.before_read(entity).await?;
        self.aprs.get(&entity).map(|apr| *apr).ok_or_else(|| SyncError::remote_read(entity, "no spot price"))
    }
}

#[async_trait]
impl TxSubmitter for MockLedger {
    async fn approve(&self, network: NetworkId, token: Address, _spender: Address, amount: U256) -> SyncResult<TxHash> {
        let entity = EntityId::new(network, token);
        self.before_read(entity).await?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::remote_read(entity, "approve rejected"));
        }
        self.allowances.insert(entity, amount);
        Ok(self.next_tx_hash())
    }

    async fn deposit(&self, network: NetworkId, pool: Address, _amount: U256) -> SyncResult<TxHash> {
        let entity = EntityId::new(network, pool);
        self.before_read(entity).await?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::remote_read(entity, "deposit rejected"));
        }
        Ok(self.next_tx_hash())
    }
}
