use super::LedgerClient;
use super::websocket::TransferWatcher;
use crate::error::{SyncError, SyncResult};
use crate::types::{Apr, EntityId, FeeSet, NetworkId, TransferEvent};
use alloy_primitives::{Address, Bytes, U256};
use alloy_sol_types::{SolCall, sol};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const SECONDS_PER_YEAR: f64 = 31_536_000.0;

sol! {
    /// Multicall3 contract interface
    contract Multicall3 {
        struct Call3 {
            address target;
            bool allowFailure;
            bytes callData;
        }

        struct CallResult {
            bool success;
            bytes returnData;
        }

        function aggregate3(Call3[] calldata calls) public payable returns (CallResult[] memory returnData);
    }

    interface IERC20 {
        function balanceOf(address owner) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        event Transfer(address indexed from, address indexed to, uint256 value);
    }

    /// Fixed-maturity yield pool
    interface IYieldPool {
        function getFeeConfig() external view returns (uint256 lpFeeBps, uint256 protocolFeeBps);
        function getSpotPrice() external view returns (uint256);
        function maturity() external view returns (uint256);
    }
}

/// Services configured for one network.
#[derive(Debug, Clone)]
pub struct NetworkEndpoint {
    pub http_url: String,
    pub wss_url: Option<String>,
    pub multicall_address: Option<Address>,
}

/// JSON-RPC ledger client covering every registered network.
#[derive(Debug)]
pub struct RpcLedgerClient {
    http_client: reqwest::Client,
    endpoints: DashMap<NetworkId, NetworkEndpoint>,
    watcher: TransferWatcher,
}

impl RpcLedgerClient {
    pub fn new(http_timeout: Duration, watcher: TransferWatcher) -> SyncResult<Self> {
        let http_client = reqwest::Client::builder().timeout(http_timeout).build()?;

        Ok(Self { http_client, endpoints: DashMap::new(), watcher })
    }

    /// Make a network's services available. Reads for unregistered networks fail with
    /// `ServiceUnavailable`.
    pub fn register_network(&self, network: NetworkId, endpoint: NetworkEndpoint) {
        info!("Registering ledger endpoint for network {}: {}", network, endpoint.http_url);
        self.endpoints.insert(network, endpoint);
    }

    pub fn has_network(&self, network: NetworkId) -> bool {
        self.endpoints.contains_key(&network)
    }

    fn endpoint(&self, network: NetworkId) -> SyncResult<NetworkEndpoint> {
        self.endpoints.get(&network).map(|endpoint| endpoint.clone()).ok_or(SyncError::ServiceUnavailable(network))
    }

    pub fn prepare_balance_call(token: Address, wallet: Address) -> Multicall3::Call3 {
        Multicall3::Call3 {
            target: token,
            allowFailure: true,
            callData: IERC20::balanceOfCall { owner: wallet }.abi_encode().into(),
        }
    }

    async fn batch_balances_via_multicall(
        &self,
        endpoint: &NetworkEndpoint,
        multicall_address: Address,
        network: NetworkId,
        tokens: &[Address],
        wallet: Address,
    ) -> SyncResult<Vec<(Address, SyncResult<U256>)>> {
        let calls: Vec<Multicall3::Call3> =
            tokens.iter().map(|token| Self::prepare_balance_call(*token, wallet)).collect();
        let data = Multicall3::aggregate3Call { calls }.abi_encode();

        let response = self.call_contract(&endpoint.http_url, multicall_address, data.into()).await?;
        let decoded = Multicall3::aggregate3Call::abi_decode_returns(&response)?;

        if decoded.len() != tokens.len() {
            return Err(SyncError::Decode(format!(
                "multicall returned {} results for {} calls",
                decoded.len(),
                tokens.len()
            )));
        }

        let results = tokens
            .iter()
            .zip(decoded)
            .map(|(token, result)| {
                let entity = EntityId::new(network, *token);
                let balance = if !result.success || result.returnData.is_empty() {
                    Err(SyncError::remote_read(entity, "balanceOf reverted"))
                } else {
                    IERC20::balanceOfCall::abi_decode_returns(&result.returnData)
                        .map_err(|e| SyncError::remote_read(entity, e))
                };
                (*token, balance)
            })
            .collect();

        Ok(results)
    }

    /// Make a contract call via RPC
    async fn call_contract(&self, rpc_url: &str, to: Address, data: Bytes) -> SyncResult<Bytes> {
        let request_body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_call",
            "params": [
                {
                    "to": format!("{:#x}", to),
                    "data": format!("{:#x}", data)
                },
                "latest"
            ],
            "id": 1
        });

        let response = self
            .http_client
            .post(rpc_url)
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await?;

        let response_json: Value = response.json().await?;
        parse_call_result(&response_json)
    }

    async fn read_pool<C: SolCall>(&self, network: NetworkId, pool: Address, call: C) -> SyncResult<C::Return> {
        let endpoint = self.endpoint(network)?;
        let entity = EntityId::new(network, pool);
        let response = self
            .call_contract(&endpoint.http_url, pool, call.abi_encode().into())
            .await
            .map_err(|e| SyncError::remote_read(entity, e))?;
        C::abi_decode_returns(&response).map_err(|e| SyncError::remote_read(entity, e))
    }
}

fn parse_call_result(response_json: &Value) -> SyncResult<Bytes> {
    if let Some(error) = response_json.get("error") {
        return Err(SyncError::Transport(format!("RPC error: {}", error)));
    }

    let result = response_json
        .get("result")
        .and_then(|r| r.as_str())
        .ok_or_else(|| SyncError::Decode("missing result in RPC response".to_string()))?;

    result.parse::<Bytes>().map_err(|e| SyncError::Decode(format!("invalid hex result: {}", e)))
}

pub fn u256_to_f64(value: U256) -> f64 {
    value.to_string().parse::<f64>().unwrap_or(0.0)
}

/// Annualised yield implied by buying at `spot_price` (1e18 = par) and redeeming at
/// par on `maturity`. A spot price above par yields a negative rate.
pub fn spot_price_apr(spot_price: U256, maturity: u64, now: u64) -> Apr {
    if spot_price.is_zero() || maturity <= now {
        return Apr(0.0);
    }

    let price = u256_to_f64(spot_price) / 1e18;
    let seconds_to_maturity = (maturity - now) as f64;
    Apr((1.0 / price - 1.0) * (SECONDS_PER_YEAR / seconds_to_maturity) * 100.0)
}

fn unix_now() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn saturating_bps(value: U256) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
    async fn read_balance(&self, network: NetworkId, token: Address, wallet: Address) -> SyncResult<U256> {
        let endpoint = self.endpoint(network)?;
        let entity = EntityId::new(network, token);
        let data = IERC20::balanceOfCall { owner: wallet }.abi_encode();
        let response = self
            .call_contract(&endpoint.http_url, token, data.into())
            .await
            .map_err(|e| SyncError::remote_read(entity, e))?;
        IERC20::balanceOfCall::abi_decode_returns(&response).map_err(|e| SyncError::remote_read(entity, e))
    }

    async fn read_balances(
        &self,
        network: NetworkId,
        tokens: &[Address],
        wallet: Address,
    ) -> Vec<(Address, SyncResult<U256>)> {
        let endpoint = match self.endpoint(network) {
            Ok(endpoint) => endpoint,
            Err(_) => {
                return tokens.iter().map(|token| (*token, Err(SyncError::ServiceUnavailable(network)))).collect();
            }
        };

        if let Some(multicall_address) = endpoint.multicall_address {
            match self.batch_balances_via_multicall(&endpoint, multicall_address, network, tokens, wallet).await {
                Ok(results) => {
                    debug!("Multicall balance batch of {} tokens on network {}", tokens.len(), network);
                    return results;
                }
                Err(e) => {
                    warn!("Multicall balance batch failed on network {}, falling back to point reads: {}", network, e);
                }
            }
        }

        join_all(tokens.iter().map(|token| async move { (*token, self.read_balance(network, *token, wallet).await) }))
            .await
    }

    async fn read_allowance(
        &self,
        network: NetworkId,
        token: Address,
        wallet: Address,
        spender: Address,
    ) -> SyncResult<U256> {
        let endpoint = self.endpoint(network)?;
        let entity = EntityId::new(network, token);
        let data = IERC20::allowanceCall { owner: wallet, spender }.abi_encode();
        let response = self
            .call_contract(&endpoint.http_url, token, data.into())
            .await
            .map_err(|e| SyncError::remote_read(entity, e))?;
        IERC20::allowanceCall::abi_decode_returns(&response).map_err(|e| SyncError::remote_read(entity, e))
    }

    async fn on_transfer(
        &self,
        network: NetworkId,
        token: Address,
        from_filter: Option<Address>,
        to_filter: Option<Address>,
    ) -> SyncResult<mpsc::Receiver<TransferEvent>> {
        let endpoint = self.endpoint(network)?;
        let wss_url = endpoint.wss_url.ok_or(SyncError::ServiceUnavailable(network))?;
        self.watcher.subscribe_transfers(wss_url, network, token, from_filter, to_filter)
    }

    async fn read_fee_config(&self, network: NetworkId, pool: Address) -> SyncResult<FeeSet> {
        let fees = self.read_pool(network, pool, IYieldPool::getFeeConfigCall {}).await?;
        Ok(FeeSet { lp_fee_bps: saturating_bps(fees.lpFeeBps), protocol_fee_bps: saturating_bps(fees.protocolFeeBps) })
    }

    async fn read_spot_derived_apr(&self, network: NetworkId, pool: Address) -> SyncResult<Apr> {
        let spot_price = self.read_pool(network, pool, IYieldPool::getSpotPriceCall {}).await?;
        let maturity = self.read_pool(network, pool, IYieldPool::maturityCall {}).await?;
        let maturity = u64::try_from(maturity).unwrap_or(u64::MAX);
        Ok(spot_price_apr(spot_price, maturity, unix_now()))
    }
}
