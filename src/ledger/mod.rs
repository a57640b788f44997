/// Ledger Access Layer
///
/// Upstream collaborators consumed by the source adapters:
/// - `LedgerClient`: point reads and push-notification registration
/// - `TxSubmitter`: opaque transaction submission used by write triggers
///
/// `RpcLedgerClient` talks JSON-RPC over HTTP (batched through Multicall3) and
/// subscribes to `Transfer` logs over WebSocket. `MockLedger` is an in-memory
/// double for tests and demos.
pub mod mock;
pub mod rpc;
pub mod websocket;

use crate::error::{SyncError, SyncResult};
use crate::types::{Apr, FeeSet, NetworkId, TransferEvent, TxHash};
use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::mpsc;

pub use mock::MockLedger;
pub use rpc::{NetworkEndpoint, RpcLedgerClient};
pub use websocket::TransferWatcher;

#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn read_balance(&self, network: NetworkId, token: Address, wallet: Address) -> SyncResult<U256>;

    /// Batched balance read. Results are per token so one failure never hides the others.
    /// The default issues the point reads concurrently.
    async fn read_balances(
        &self,
        network: NetworkId,
        tokens: &[Address],
        wallet: Address,
    ) -> Vec<(Address, SyncResult<U256>)> {
        join_all(tokens.iter().map(|token| async move { (*token, self.read_balance(network, *token, wallet).await) }))
            .await
    }

    async fn read_allowance(
        &self,
        network: NetworkId,
        token: Address,
        wallet: Address,
        spender: Address,
    ) -> SyncResult<U256>;

    /// Register for `Transfer` notifications of `token`. `None` filters match any address.
    async fn on_transfer(
        &self,
        network: NetworkId,
        token: Address,
        from_filter: Option<Address>,
        to_filter: Option<Address>,
    ) -> SyncResult<mpsc::Receiver<TransferEvent>>;

    async fn read_fee_config(&self, network: NetworkId, pool: Address) -> SyncResult<FeeSet>;

    async fn read_spot_derived_apr(&self, network: NetworkId, pool: Address) -> SyncResult<Apr>;
}

#[async_trait]
pub trait TxSubmitter: Send + Sync {
    async fn approve(&self, network: NetworkId, token: Address, spender: Address, amount: U256) -> SyncResult<TxHash>;

    async fn deposit(&self, network: NetworkId, pool: Address, amount: U256) -> SyncResult<TxHash>;
}

/// Submitter for deployments without a signing backend. Every write fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOnly;

#[async_trait]
impl TxSubmitter for ReadOnly {
    async fn approve(&self, network: NetworkId, _token: Address, _spender: Address, _amount: U256) -> SyncResult<TxHash> {
        Err(SyncError::WritesDisabled(network))
    }

    async fn deposit(&self, network: NetworkId, _pool: Address, _amount: U256) -> SyncResult<TxHash> {
        Err(SyncError::WritesDisabled(network))
    }
}
