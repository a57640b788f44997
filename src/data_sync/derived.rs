use super::lifecycle::{Lifecycle, Subscription};
use super::registry::{CellMap, ChangeFeed, EntityRegistry, EntityState};
use super::session::Session;
use crate::error::SyncError;
use crate::ledger::LedgerClient;
use crate::types::{Apr, ApprovalRequirement, CellValue, EntityId};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Outcome of one recomputation.
#[derive(Debug, Clone, PartialEq)]
pub enum Computed<O> {
    Value(O),
    /// A required input is missing, the output goes back to unresolved.
    Unresolved,
    /// Keep the previous output, e.g. after a failed remote read.
    Skip,
}

type ComputeFn<O> = Arc<dyn Fn() -> BoxFuture<'static, Computed<O>> + Send + Sync>;

struct ChainNode<O> {
    id: EntityId,
    inputs: Vec<Arc<dyn ChangeFeed>>,
    compute: ComputeFn<O>,
    refresh: Arc<Notify>,
}

struct ChainShared<O> {
    name: &'static str,
    outputs: Arc<CellMap<O>>,
    epoch: AtomicU64,
    // serializes output writes against reset
    gate: Mutex<()>,
}

impl<O: CellValue> ChainShared<O> {
    fn apply(&self, cell: &EntityState<O>, epoch: u64, computed: Computed<O>) {
        let _gate = self.gate.lock();
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("`{}` dropped result for {} computed before a reset", self.name, cell.entity_id());
            return;
        }
        let changed = match computed {
            Computed::Value(value) => cell.set(value),
            Computed::Unresolved => cell.clear(),
            Computed::Skip => false,
        };
        if changed {
            debug!("`{}` output for {} is now {:?}", self.name, cell.entity_id(), cell.value());
        }
    }
}

/// Recompute one output whenever any of its inputs changes or a refresh is requested.
/// A change arriving mid-computation abandons the stale computation and starts over.
async fn run_node<O: CellValue>(
    shared: Arc<ChainShared<O>>,
    cell: EntityState<O>,
    inputs: Vec<Arc<dyn ChangeFeed>>,
    compute: ComputeFn<O>,
    refresh: Arc<Notify>,
) {
    let mut changes = futures::stream::select_all(inputs.iter().map(|input| input.changes()));

    'recompute: loop {
        let epoch = shared.epoch.load(Ordering::SeqCst);
        let mut pending = compute();

        tokio::select! {
            computed = &mut pending => shared.apply(&cell, epoch, computed),
            change = changes.next() => {
                if change.is_none() {
                    break 'recompute;
                }
                continue 'recompute;
            }
            () = refresh.notified() => continue 'recompute,
        }

        tokio::select! {
            change = changes.next() => {
                if change.is_none() {
                    break 'recompute;
                }
            }
            () = refresh.notified() => {}
        }
    }

    debug!("`{}` inputs of {} closed", shared.name, cell.entity_id());
}

/// Combine-latest join of registry and session cells into one output cell per entity.
pub struct DerivedChain<O: CellValue> {
    shared: Arc<ChainShared<O>>,
    nodes: Vec<ChainNode<O>>,
    refresh_index: HashMap<EntityId, Arc<Notify>>,
    next_subscription_id: AtomicU64,
    active: Mutex<Option<Subscription>>,
}

impl<O: CellValue> DerivedChain<O> {
    pub fn new(name: &'static str, outputs: Arc<CellMap<O>>) -> Self {
        Self {
            shared: Arc::new(ChainShared { name, outputs, epoch: AtomicU64::new(0), gate: Mutex::new(()) }),
            nodes: Vec::new(),
            refresh_index: HashMap::new(),
            next_subscription_id: AtomicU64::new(0),
            active: Mutex::new(None),
        }
    }

    /// Add the output for `id`. `compute` is called again on every input change.
    pub fn with_node<F>(mut self, id: EntityId, inputs: Vec<Arc<dyn ChangeFeed>>, compute: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Computed<O>> + Send + Sync + 'static,
    {
        let refresh = Arc::new(Notify::new());
        self.refresh_index.insert(id, Arc::clone(&refresh));
        self.nodes.push(ChainNode { id, inputs, compute: Arc::new(compute), refresh });
        self
    }

    pub fn outputs(&self) -> &Arc<CellMap<O>> {
        &self.shared.outputs
    }

    pub fn cell(&self, id: &EntityId) -> EntityState<O> {
        self.shared.outputs.lookup(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Recompute one output even though no input changed. Returns false when the
    /// chain is not running or has no node for `id`.
    pub fn refresh(&self, id: &EntityId) -> bool {
        if !self.is_subscribed() {
            return false;
        }
        match self.refresh_index.get(id) {
            Some(refresh) => {
                debug!("`{}` refresh requested for {}", self.shared.name, id);
                refresh.notify_one();
                true
            }
            None => false,
        }
    }
}

impl<O: CellValue> Lifecycle for DerivedChain<O> {
    fn name(&self) -> &'static str {
        self.shared.name
    }

    fn subscribe(&self) {
        let mut active = self.active.lock();
        if let Some(previous) = active.take() {
            info!("`{}` already subscribed, tearing down subscription {}", self.shared.name, previous.id());
        }

        let subscription_id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut subscription = Subscription::new(subscription_id, self.shared.name);
        for node in &self.nodes {
            subscription.push(tokio::spawn(run_node(
                Arc::clone(&self.shared),
                self.shared.outputs.lookup(&node.id),
                node.inputs.clone(),
                Arc::clone(&node.compute),
                Arc::clone(&node.refresh),
            )));
        }

        info!("`{}` subscribed ({} outputs)", self.shared.name, self.nodes.len());
        *active = Some(subscription);
    }

    fn unsubscribe(&self) {
        if let Some(previous) = self.active.lock().take() {
            info!("`{}` unsubscribed (subscription {})", self.shared.name, previous.id());
        }
    }

    fn reset(&self) {
        let _gate = self.shared.gate.lock();
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        let cleared = self.shared.outputs.clear_all();
        info!("`{}` reset ({} outputs cleared)", self.shared.name, cleared);
    }

    fn is_subscribed(&self) -> bool {
        self.active.lock().is_some()
    }
}

/// Whether each token needs an approval before depositing.
///
/// Inputs are the balance cell, the active signer and the network's spender. A zero
/// balance never needs approval and skips the allowance read.
pub fn approval_requirements(
    registry: &EntityRegistry,
    session: &Session,
    ledger: Arc<dyn LedgerClient>,
) -> DerivedChain<ApprovalRequirement> {
    let mut chain = DerivedChain::new("approvals", Arc::clone(registry.approvals()));

    for id in registry.token_ids() {
        let balance = registry.balances().lookup(&id);
        let signer = session.signer_cell().clone();
        let spender = registry.spender(id.network);
        let ledger = Arc::clone(&ledger);

        let inputs: Vec<Arc<dyn ChangeFeed>> = vec![Arc::new(balance.clone()), Arc::new(signer.clone())];
        chain = chain.with_node(id, inputs, move || {
            let (balance, wallet, ledger) = (balance.value(), signer.get(), Arc::clone(&ledger));
            async move {
                let (Some(balance), Some(wallet)) = (balance, wallet) else {
                    return Computed::Unresolved;
                };
                if balance.is_zero() {
                    return Computed::Value(ApprovalRequirement::AlwaysApproved);
                }
                let Some(spender) = spender else {
                    warn!("approvals: {} for {}", SyncError::NoSpender(id.network), id);
                    return Computed::Unresolved;
                };

                match ledger.read_allowance(id.network, id.address, wallet, spender).await {
                    Ok(allowance) => Computed::Value(ApprovalRequirement::from_allowance(balance, allowance)),
                    Err(e) => {
                        warn!("approvals: allowance read for {} failed: {}", id, e);
                        Computed::Skip
                    }
                }
            }
            .boxed()
        });
    }

    chain
}

/// `true` for pools whose spot price implies a negative APR.
pub fn negative_interest(registry: &EntityRegistry) -> DerivedChain<bool> {
    let mut chain = DerivedChain::new("negative_interest", Arc::clone(registry.negative_interest()));

    for id in registry.pool_ids() {
        let apr = registry.aprs().lookup(&id);
        let inputs: Vec<Arc<dyn ChangeFeed>> = vec![Arc::new(apr.clone())];
        chain = chain.with_node(id, inputs, move || {
            let computed = match apr.value() {
                Some(apr) => Computed::Value(apr.is_negative()),
                None => Computed::Unresolved,
            };
            futures::future::ready(computed).boxed()
        });
    }

    chain
}

/// APR net of the pool's total fee, in percentage points.
pub fn net_yields(registry: &EntityRegistry) -> DerivedChain<Apr> {
    let mut chain = DerivedChain::new("net_yields", Arc::clone(registry.net_yields()));

    for id in registry.pool_ids() {
        let apr = registry.aprs().lookup(&id);
        let fees = registry.fees().lookup(&id);
        let inputs: Vec<Arc<dyn ChangeFeed>> = vec![Arc::new(apr.clone()), Arc::new(fees.clone())];
        chain = chain.with_node(id, inputs, move || {
            let computed = match (apr.value(), fees.value()) {
                (Some(apr), Some(fees)) => Computed::Value(Apr(apr.0 - fees.total_percent())),
                _ => Computed::Unresolved,
            };
            futures::future::ready(computed).boxed()
        });
    }

    chain
}
