use tokio::task::JoinHandle;
use tracing::debug;

/// Start/stop/reset control of one pipeline or derived chain, independent of consumers.
pub trait Lifecycle: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start the adapters. Tears down a previous subscription first, so calling it
    /// twice never runs two adapter sets side by side.
    fn subscribe(&self);

    /// Stop emitting. Already published values stay in place.
    fn unsubscribe(&self);

    /// Restore every in-scope cell to unresolved without touching the subscription.
    fn reset(&self);

    fn is_subscribed(&self) -> bool;
}

/// The tasks backing one active subscription. Dropping it aborts them all.
pub struct Subscription {
    id: u64,
    name: &'static str,
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(id: u64, name: &'static str) -> Self {
        Self { id, name, tasks: Vec::new() }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn push(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    pub fn extend(&mut self, tasks: impl IntoIterator<Item = JoinHandle<()>>) {
        self.tasks.extend(tasks);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks that are still running.
    pub fn live_tasks(&self) -> usize {
        self.tasks.iter().filter(|task| !task.is_finished()).count()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        debug!("Cancelling subscription {} of `{}` ({} tasks)", self.id, self.name, self.tasks.len());
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_drop_aborts_tasks() {
        let (guard_tx, guard_rx) = oneshot::channel::<()>();
        let mut subscription = Subscription::new(1, "test");
        subscription.push(tokio::spawn(async move {
            let _guard = guard_tx;
            std::future::pending::<()>().await;
        }));
        assert_eq!(subscription.len(), 1);
        assert_eq!(subscription.live_tasks(), 1);

        drop(subscription);

        // the aborted task drops its guard without sending
        assert!(guard_rx.await.is_err());
    }
}
