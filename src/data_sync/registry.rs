use super::binding::Binding;
use super::network_config::RegistryConfig;
use crate::error::SyncError;
use crate::types::{
    Apr, ApprovalRequirement, CellValue, Entity, EntityId, EntityKind, FeeSet, NetworkId, PoolEntity, TokenEntity,
    TxStatus,
};
use alloy_primitives::{Address, U256};
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

/// Anything a derived chain can wait on for changes.
pub trait ChangeFeed: Send + Sync {
    /// Stream yielding once per observed change. Ends when the source is dropped.
    fn changes(&self) -> BoxStream<'static, ()>;
}

pub(crate) fn watch_changes<V: Send + Sync + 'static>(mut rx: watch::Receiver<V>) -> BoxStream<'static, ()> {
    rx.mark_unchanged();
    futures::stream::unfold(rx, |mut rx| async move { rx.changed().await.ok().map(|_| ((), rx)) }).boxed()
}

/// The state cell of one entity for one fact. `None` means not yet resolved.
///
/// Clones share the cell. Only pipelines and chains write to it.
#[derive(Clone, Debug)]
pub struct EntityState<T> {
    entity_id: EntityId,
    tx: Arc<watch::Sender<Option<T>>>,
}

impl<T: CellValue> EntityState<T> {
    fn new(entity_id: EntityId) -> Self {
        Self { entity_id, tx: Arc::new(watch::Sender::new(None)) }
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn value(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn binding(&self) -> Binding<Option<T>> {
        Binding::new(self.tx.subscribe())
    }

    /// Number of live bindings on this cell.
    pub fn observers(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Returns true when the stored value changed.
    pub(crate) fn set(&self, value: T) -> bool {
        self.tx.send_if_modified(|current| {
            if current.as_ref() == Some(&value) {
                return false;
            }
            *current = Some(value);
            true
        })
    }

    pub(crate) fn clear(&self) -> bool {
        self.tx.send_if_modified(|current| current.take().is_some())
    }
}

impl<T: CellValue> ChangeFeed for EntityState<T> {
    fn changes(&self) -> BoxStream<'static, ()> {
        watch_changes(self.tx.subscribe())
    }
}

/// All cells of one fact, one per registered entity. The key set never changes.
#[derive(Debug)]
pub struct CellMap<T> {
    fact: &'static str,
    cells: HashMap<EntityId, EntityState<T>>,
}

impl<T: CellValue> CellMap<T> {
    pub fn new(fact: &'static str, ids: impl IntoIterator<Item = EntityId>) -> Self {
        let cells = ids.into_iter().map(|id| (id, EntityState::new(id))).collect();
        Self { fact, cells }
    }

    pub fn fact(&self) -> &'static str {
        self.fact
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.cells.contains_key(id)
    }

    pub fn try_get(&self, id: &EntityId) -> Option<&EntityState<T>> {
        self.cells.get(id)
    }

    /// Look up the cell of a registered entity.
    ///
    /// Asking for an unregistered entity is a bug: debug builds panic, release builds
    /// log and hand out a detached cell that never resolves.
    pub fn lookup(&self, id: &EntityId) -> EntityState<T> {
        match self.cells.get(id) {
            Some(cell) => cell.clone(),
            None => {
                debug_assert!(false, "{}", SyncError::UnknownEntity(*id));
                error!("`{}` lookup of unregistered entity {}", self.fact, id);
                EntityState::new(*id)
            }
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &EntityId> {
        self.cells.keys()
    }

    pub fn cells(&self) -> impl Iterator<Item = &EntityState<T>> {
        self.cells.values()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn resolved_count(&self) -> usize {
        self.cells.values().filter(|cell| cell.is_resolved()).count()
    }

    pub(crate) fn clear_all(&self) -> usize {
        self.cells.values().filter(|cell| cell.clear()).count()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkInfo {
    pub id: NetworkId,
    pub name: String,
    pub spender: Option<Address>,
}

/// One cell per tracked entity and fact, built once from configuration and shared by
/// every adapter, chain and consumer.
#[derive(Debug)]
pub struct EntityRegistry {
    networks: BTreeMap<NetworkId, NetworkInfo>,
    tokens: BTreeMap<EntityId, TokenEntity>,
    pools: BTreeMap<EntityId, PoolEntity>,

    balances: Arc<CellMap<U256>>,
    fees: Arc<CellMap<FeeSet>>,
    aprs: Arc<CellMap<Apr>>,
    approvals: Arc<CellMap<ApprovalRequirement>>,
    negative_interest: Arc<CellMap<bool>>,
    net_yields: Arc<CellMap<Apr>>,
    tx_statuses: Arc<CellMap<TxStatus>>,
}

impl EntityRegistry {
    pub fn from_config(config: &RegistryConfig) -> Result<Self, SyncError> {
        config.validate().map_err(|e| SyncError::InternalEyre(eyre::eyre!(e)))?;

        let mut networks = BTreeMap::new();
        let mut tokens: BTreeMap<EntityId, TokenEntity> = BTreeMap::new();
        let mut pools = BTreeMap::new();

        for network in &config.networks {
            let network_id = network.network_id();
            networks.insert(
                network_id,
                NetworkInfo { id: network_id, name: network.name.clone(), spender: network.spender },
            );

            for pool in &network.pools {
                let pool_id = EntityId::new(network_id, pool.address);
                let pool_tokens: Vec<Address> =
                    pool.tokens.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();

                for token in &pool_tokens {
                    let token_id = EntityId::new(network_id, *token);
                    let entry = tokens.entry(token_id).or_insert_with(|| TokenEntity { id: token_id, pools: Vec::new() });
                    if !entry.pools.contains(&pool.address) {
                        entry.pools.push(pool.address);
                    }
                }

                pools.insert(pool_id, PoolEntity { id: pool_id, tokens: pool_tokens });
            }
        }

        let token_ids: Vec<EntityId> = tokens.keys().copied().collect();
        let pool_ids: Vec<EntityId> = pools.keys().copied().collect();
        let write_targets: BTreeSet<EntityId> = token_ids.iter().chain(pool_ids.iter()).copied().collect();

        info!(
            "Entity registry built: {} networks, {} tokens, {} pools",
            networks.len(),
            token_ids.len(),
            pool_ids.len()
        );

        Ok(Self {
            networks,
            balances: Arc::new(CellMap::new("balances", token_ids.iter().copied())),
            approvals: Arc::new(CellMap::new("approvals", token_ids.iter().copied())),
            fees: Arc::new(CellMap::new("fees", pool_ids.iter().copied())),
            aprs: Arc::new(CellMap::new("aprs", pool_ids.iter().copied())),
            negative_interest: Arc::new(CellMap::new("negative_interest", pool_ids.iter().copied())),
            net_yields: Arc::new(CellMap::new("net_yields", pool_ids.iter().copied())),
            tx_statuses: Arc::new(CellMap::new("tx_statuses", write_targets)),
            tokens,
            pools,
        })
    }

    pub fn networks(&self) -> impl Iterator<Item = &NetworkInfo> {
        self.networks.values()
    }

    pub fn network(&self, id: NetworkId) -> Option<&NetworkInfo> {
        self.networks.get(&id)
    }

    pub fn spender(&self, network: NetworkId) -> Option<Address> {
        self.networks.get(&network).and_then(|info| info.spender)
    }

    pub fn entity(&self, kind: EntityKind, id: &EntityId) -> Option<Entity> {
        match kind {
            EntityKind::Token => self.tokens.get(id).cloned().map(Entity::Token),
            EntityKind::Pool => self.pools.get(id).cloned().map(Entity::Pool),
        }
    }

    pub fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.tokens
            .values()
            .cloned()
            .map(Entity::Token)
            .chain(self.pools.values().cloned().map(Entity::Pool))
    }

    pub fn token_ids(&self) -> Vec<EntityId> {
        self.tokens.keys().copied().collect()
    }

    pub fn pool_ids(&self) -> Vec<EntityId> {
        self.pools.keys().copied().collect()
    }

    pub fn token_ids_on(&self, network: NetworkId) -> Vec<EntityId> {
        self.tokens.keys().filter(|id| id.network == network).copied().collect()
    }

    pub fn pool_ids_on(&self, network: NetworkId) -> Vec<EntityId> {
        self.pools.keys().filter(|id| id.network == network).copied().collect()
    }

    pub fn balances(&self) -> &Arc<CellMap<U256>> {
        &self.balances
    }

    pub fn fees(&self) -> &Arc<CellMap<FeeSet>> {
        &self.fees
    }

    pub fn aprs(&self) -> &Arc<CellMap<Apr>> {
        &self.aprs
    }

    pub fn approvals(&self) -> &Arc<CellMap<ApprovalRequirement>> {
        &self.approvals
    }

    pub fn negative_interest(&self) -> &Arc<CellMap<bool>> {
        &self.negative_interest
    }

    pub fn net_yields(&self) -> &Arc<CellMap<Apr>> {
        &self.net_yields
    }

    pub fn tx_statuses(&self) -> &Arc<CellMap<TxStatus>> {
        &self.tx_statuses
    }
}
