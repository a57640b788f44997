use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Read side of a published value: a cell, a derived fact or a whole snapshot.
///
/// Every binding of the same source shares one watch channel, so adding observers
/// never adds remote reads.
#[derive(Debug, Clone)]
pub struct Binding<V> {
    rx: watch::Receiver<V>,
}

impl<V: Clone + Send + Sync + 'static> Binding<V> {
    pub(crate) fn new(rx: watch::Receiver<V>) -> Self {
        Self { rx }
    }

    /// Most recently published value, or the initial default before the first publish.
    pub fn snapshot(&self) -> V {
        self.rx.borrow().clone()
    }

    /// Wait for the next publish. Returns false once the source is gone.
    pub async fn changed(&mut self) -> bool {
        let changed = self.rx.changed().await.is_ok();
        if changed {
            self.rx.borrow_and_update();
        }
        changed
    }

    /// Wait until `predicate` holds for the current value and return it.
    pub async fn wait_for(&mut self, mut predicate: impl FnMut(&V) -> bool) -> Option<V> {
        self.rx.wait_for(|value| predicate(value)).await.ok().map(|value| value.clone())
    }

    /// Run `handler` after every publish until the returned handle is dropped.
    pub fn on_change<F>(&self, handler: F) -> ObserverHandle
    where
        F: Fn(&V) + Send + 'static,
    {
        let mut rx = self.rx.clone();
        rx.mark_unchanged();

        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let value = rx.borrow_and_update().clone();
                handler(&value);
            }
            debug!("Observer source closed");
        });

        ObserverHandle { task }
    }
}

/// Cancels its observer when dropped.
#[derive(Debug)]
pub struct ObserverHandle {
    task: JoinHandle<()>,
}

impl ObserverHandle {
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
