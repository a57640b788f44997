use super::binding::Binding;
use super::registry::{ChangeFeed, watch_changes};
use crate::types::NetworkId;
use alloy_primitives::Address;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Transient session input such as the active signer. `None` means unset.
#[derive(Debug, Clone)]
pub struct SessionCell<T> {
    tx: Arc<watch::Sender<Option<T>>>,
}

impl<T: Clone + PartialEq + Send + Sync + 'static> SessionCell<T> {
    fn new() -> Self {
        Self { tx: Arc::new(watch::Sender::new(None)) }
    }

    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Returns true when the value changed.
    pub fn set(&self, value: Option<T>) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        })
    }

    pub fn binding(&self) -> Binding<Option<T>> {
        Binding::new(self.tx.subscribe())
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> ChangeFeed for SessionCell<T> {
    fn changes(&self) -> BoxStream<'static, ()> {
        watch_changes(self.tx.subscribe())
    }
}

/// Wallet and network selection of the interactive session.
#[derive(Debug, Clone)]
pub struct Session {
    signer: SessionCell<Address>,
    network: SessionCell<NetworkId>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self { signer: SessionCell::new(), network: SessionCell::new() }
    }

    pub fn signer(&self) -> Option<Address> {
        self.signer.get()
    }

    pub fn active_network(&self) -> Option<NetworkId> {
        self.network.get()
    }

    pub fn set_signer(&self, signer: Option<Address>) -> bool {
        let changed = self.signer.set(signer);
        if changed {
            info!("Active signer changed to {:?}", signer);
        }
        changed
    }

    pub fn set_active_network(&self, network: Option<NetworkId>) -> bool {
        let changed = self.network.set(network);
        if changed {
            info!("Active network changed to {:?}", network);
        }
        changed
    }

    pub fn signer_cell(&self) -> &SessionCell<Address> {
        &self.signer
    }

    pub fn network_cell(&self) -> &SessionCell<NetworkId> {
        &self.network
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_session_changes_are_observable() {
        let session = Session::new();
        let mut changes = session.signer_cell().changes();
        assert_eq!(session.signer(), None);

        assert!(session.set_signer(Some(Address::repeat_byte(0x01))));
        assert!(!session.set_signer(Some(Address::repeat_byte(0x01))));
        assert_eq!(changes.next().await, Some(()));

        let clone = session.clone();
        clone.set_active_network(Some(NetworkId(5000)));
        assert_eq!(session.active_network(), Some(NetworkId(5000)));
    }
}
