use super::adapters::SourceAdapter;
use super::binding::Binding;
use super::lifecycle::{Lifecycle, Subscription};
use super::registry::{CellMap, EntityState};
use crate::types::{CellValue, EntityId, SnapshotMap};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Partial update tagged with the reset epoch its reads started in
type Partial<T> = (u64, SnapshotMap<T>);

/// Write side handed to source adapters.
#[derive(Debug)]
pub struct UpdateSink<T> {
    tx: mpsc::Sender<Partial<T>>,
    epoch: Arc<AtomicU64>,
}

impl<T> Clone for UpdateSink<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone(), epoch: Arc::clone(&self.epoch) }
    }
}

impl<T: CellValue> UpdateSink<T> {
    /// Reset epoch to stamp on reads that are about to start.
    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Send updates read during `epoch`. Updates from before a reset are discarded by
    /// the pipeline. Returns false once the pipeline is gone.
    pub async fn emit_at(&self, epoch: u64, updates: SnapshotMap<T>) -> bool {
        if updates.is_empty() {
            return !self.tx.is_closed();
        }
        self.tx.send((epoch, updates)).await.is_ok()
    }

    pub async fn emit(&self, updates: SnapshotMap<T>) -> bool {
        self.emit_at(self.current_epoch(), updates).await
    }

    pub async fn emit_one(&self, id: EntityId, value: T) -> bool {
        self.emit(SnapshotMap::from([(id, value)])).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Counters of one pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub updates_received: u64,
    pub stale_dropped: u64,
    pub unknown_dropped: u64,
    pub snapshots_published: u64,
}

#[derive(Debug, Default)]
struct PipelineCounters {
    updates_received: AtomicU64,
    stale_dropped: AtomicU64,
    unknown_dropped: AtomicU64,
    snapshots_published: AtomicU64,
}

/// State shared between a pipeline handle and its owner task.
struct Shared<T> {
    name: &'static str,
    cells: Arc<CellMap<T>>,
    snapshot_tx: watch::Sender<Arc<SnapshotMap<T>>>,
    epoch: Arc<AtomicU64>,
    // id of the subscription allowed to publish, 0 when none
    active: AtomicU64,
    // serializes publish against reset and unsubscribe
    gate: Mutex<()>,
    counters: PipelineCounters,
}

impl<T: CellValue> Shared<T> {
    /// Merge a partial update into the accumulator, last write wins.
    fn fold(&self, acc: &mut SnapshotMap<T>, updates: SnapshotMap<T>) -> usize {
        let mut folded = 0;
        for (id, value) in updates {
            if !self.cells.contains(&id) {
                self.counters.unknown_dropped.fetch_add(1, Ordering::Relaxed);
                warn!("`{}` dropped update for unregistered entity {}", self.name, id);
                continue;
            }
            acc.insert(id, value);
            folded += 1;
        }
        folded
    }

    fn publish(&self, subscription_id: u64, acc_epoch: u64, acc: &SnapshotMap<T>) {
        let _gate = self.gate.lock();

        if self.active.load(Ordering::SeqCst) != subscription_id {
            debug!("`{}` subscription {} is no longer active, not publishing", self.name, subscription_id);
            return;
        }
        if self.epoch.load(Ordering::SeqCst) != acc_epoch {
            debug!("`{}` reset since the burst started, not publishing", self.name);
            return;
        }

        let changed = acc
            .iter()
            .filter_map(|(id, value)| self.cells.try_get(id).map(|cell| cell.set(value.clone())))
            .filter(|changed| *changed)
            .count();

        self.snapshot_tx.send_replace(Arc::new(acc.clone()));
        self.counters.snapshots_published.fetch_add(1, Ordering::Relaxed);
        debug!("`{}` published snapshot of {} entities ({} changed)", self.name, acc.len(), changed);
    }

    fn set_active(&self, subscription_id: u64) {
        let _gate = self.gate.lock();
        self.active.store(subscription_id, Ordering::SeqCst);
    }
}

/// Single owner of the accumulator: folds partials in arrival order and publishes once
/// a burst has been quiet for `quiescence`.
async fn run_owner<T: CellValue>(
    shared: Arc<Shared<T>>,
    subscription_id: u64,
    mut rx: mpsc::Receiver<Partial<T>>,
    quiescence: Duration,
) {
    debug!("`{}` owner task {} started", shared.name, subscription_id);

    let mut acc: SnapshotMap<T> = SnapshotMap::new();
    let mut acc_epoch = shared.epoch.load(Ordering::SeqCst);
    let mut dirty = false;
    let deadline = tokio::time::sleep(quiescence);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            partial = rx.recv() => {
                let Some((epoch, updates)) = partial else {
                    break;
                };
                shared.counters.updates_received.fetch_add(1, Ordering::Relaxed);

                let current = shared.epoch.load(Ordering::SeqCst);
                if acc_epoch != current {
                    acc.clear();
                    acc_epoch = current;
                    dirty = false;
                }
                if epoch != current {
                    shared.counters.stale_dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("`{}` dropped {} updates read before a reset", shared.name, updates.len());
                    continue;
                }

                if shared.fold(&mut acc, updates) > 0 {
                    dirty = true;
                    deadline.as_mut().reset(Instant::now() + quiescence);
                }
            }
            () = &mut deadline, if dirty => {
                dirty = false;
                shared.publish(subscription_id, acc_epoch, &acc);
            }
        }
    }

    debug!("`{}` owner task {} ended", shared.name, subscription_id);
}

struct ActiveSubscription<T> {
    subscription: Subscription,
    sink: UpdateSink<T>,
}

/// Aggregation pipeline of one logical fact.
///
/// Source adapters send partial maps to one owner task which folds them, coalesces
/// bursts, writes the registry cells and republishes the whole snapshot.
pub struct Pipeline<T: CellValue> {
    shared: Arc<Shared<T>>,
    adapters: Vec<Arc<dyn SourceAdapter<T>>>,
    quiescence: Duration,
    buffer_size: usize,
    next_subscription_id: AtomicU64,
    active: Mutex<Option<ActiveSubscription<T>>>,
}

impl<T: CellValue> Pipeline<T> {
    pub fn new(name: &'static str, cells: Arc<CellMap<T>>, quiescence: Duration, buffer_size: usize) -> Self {
        let shared = Shared {
            name,
            cells,
            snapshot_tx: watch::Sender::new(Arc::new(SnapshotMap::new())),
            epoch: Arc::new(AtomicU64::new(0)),
            active: AtomicU64::new(0),
            gate: Mutex::new(()),
            counters: PipelineCounters::default(),
        };

        Self {
            shared: Arc::new(shared),
            adapters: Vec::new(),
            quiescence,
            buffer_size: buffer_size.max(1),
            next_subscription_id: AtomicU64::new(0),
            active: Mutex::new(None),
        }
    }

    pub fn with_adapter(mut self, adapter: impl SourceAdapter<T> + 'static) -> Self {
        self.adapters.push(Arc::new(adapter));
        self
    }

    pub fn adapter_names(&self) -> Vec<&'static str> {
        self.adapters.iter().map(|adapter| adapter.name()).collect()
    }

    pub fn quiescence(&self) -> Duration {
        self.quiescence
    }

    pub fn cells(&self) -> &Arc<CellMap<T>> {
        &self.shared.cells
    }

    pub fn cell(&self, id: &EntityId) -> EntityState<T> {
        self.shared.cells.lookup(id)
    }

    /// Bulk view of the last published snapshot.
    pub fn binding(&self) -> Binding<Arc<SnapshotMap<T>>> {
        Binding::new(self.shared.snapshot_tx.subscribe())
    }

    pub fn snapshot(&self) -> Arc<SnapshotMap<T>> {
        self.shared.snapshot_tx.borrow().clone()
    }

    /// Sink of the active subscription, for writers that are not adapters.
    pub fn sink(&self) -> Option<UpdateSink<T>> {
        self.active.lock().as_ref().map(|active| active.sink.clone())
    }

    pub fn stats(&self) -> PipelineStats {
        let counters = &self.shared.counters;
        PipelineStats {
            updates_received: counters.updates_received.load(Ordering::Relaxed),
            stale_dropped: counters.stale_dropped.load(Ordering::Relaxed),
            unknown_dropped: counters.unknown_dropped.load(Ordering::Relaxed),
            snapshots_published: counters.snapshots_published.load(Ordering::Relaxed),
        }
    }
}

impl<T: CellValue> Lifecycle for Pipeline<T> {
    fn name(&self) -> &'static str {
        self.shared.name
    }

    fn subscribe(&self) {
        let mut active = self.active.lock();
        if let Some(previous) = active.take() {
            info!("`{}` already subscribed, tearing down subscription {}", self.shared.name, previous.subscription.id());
            self.shared.set_active(0);
            drop(previous);
        }

        let subscription_id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let sink = UpdateSink { tx, epoch: Arc::clone(&self.shared.epoch) };

        self.shared.set_active(subscription_id);

        let mut subscription = Subscription::new(subscription_id, self.shared.name);
        subscription.push(tokio::spawn(run_owner(Arc::clone(&self.shared), subscription_id, rx, self.quiescence)));
        subscription.extend(self.adapters.iter().map(|adapter| adapter.spawn(sink.clone())));

        info!(
            "`{}` subscribed (subscription {}, adapters: {:?})",
            self.shared.name,
            subscription_id,
            self.adapter_names()
        );
        *active = Some(ActiveSubscription { subscription, sink });
    }

    fn unsubscribe(&self) {
        let mut active = self.active.lock();
        self.shared.set_active(0);
        if let Some(previous) = active.take() {
            info!("`{}` unsubscribed (subscription {})", self.shared.name, previous.subscription.id());
        }
    }

    fn reset(&self) {
        let _gate = self.shared.gate.lock();
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let cleared = self.shared.cells.clear_all();
        self.shared.snapshot_tx.send_replace(Arc::new(SnapshotMap::new()));
        info!("`{}` reset to epoch {} ({} cells cleared)", self.shared.name, epoch, cleared);
    }

    fn is_subscribed(&self) -> bool {
        self.active.lock().is_some()
    }
}

impl<T: CellValue> Drop for Pipeline<T> {
    fn drop(&mut self) {
        self.shared.set_active(0);
    }
}
