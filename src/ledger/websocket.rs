use super::rpc::IERC20;
use crate::data_sync::config::SyncConfig;
use crate::error::SyncResult;
use crate::types::{NetworkId, TransferEvent};
use alloy_primitives::{Address, B256, Bytes, U256};
use alloy_sol_types::SolEvent;
use eyre::{Result, eyre};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

/// Raw log entry delivered by a `logs` subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    #[serde(rename = "blockNumber", default)]
    pub block_number: Option<String>,
}

impl RawLog {
    /// Decode an ERC-20 `Transfer` log. Returns `None` for any other event.
    pub fn to_transfer(&self, network: NetworkId) -> Option<TransferEvent> {
        if self.topics.len() != 3 || self.topics[0] != IERC20::Transfer::SIGNATURE_HASH {
            return None;
        }
        let value = if self.data.len() >= 32 { U256::from_be_slice(&self.data[..32]) } else { U256::ZERO };
        let block_number = self
            .block_number
            .as_deref()
            .and_then(|number| u64::from_str_radix(number.trim_start_matches("0x"), 16).ok());

        Some(TransferEvent {
            network,
            token: self.address,
            from: Address::from_word(self.topics[1]),
            to: Address::from_word(self.topics[2]),
            value,
            block_number,
        })
    }
}

/// Subscription parameters for one `Transfer` watch
#[derive(Debug, Clone)]
struct TransferFilter {
    network: NetworkId,
    token: Address,
    from: Option<Address>,
    to: Option<Address>,
}

impl TransferFilter {
    fn subscribe_request(&self) -> Value {
        let topic = |filter: Option<Address>| match filter {
            Some(address) => Value::String(format!("{:#x}", address.into_word())),
            None => Value::Null,
        };

        serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_subscribe",
            "params": ["logs", {
                "address": format!("{:#x}", self.token),
                "topics": [
                    format!("{:#x}", IERC20::Transfer::SIGNATURE_HASH),
                    topic(self.from),
                    topic(self.to),
                ]
            }]
        })
    }
}

/// Consecutive failed connection attempts. Cleared by every confirmed subscription.
#[derive(Debug, Clone, Copy)]
struct ReconnectBudget {
    failures: u32,
    max_attempts: u32,
}

impl ReconnectBudget {
    fn new(max_attempts: u32) -> Self {
        Self { failures: 0, max_attempts }
    }

    /// Record a failure. `None` once the budget is spent.
    fn next_attempt(&mut self) -> Option<u32> {
        self.failures += 1;
        (self.failures < self.max_attempts).then_some(self.failures)
    }

    fn clear(&mut self) {
        self.failures = 0;
    }
}

/// WebSocket watcher delivering ERC-20 `Transfer` notifications
#[derive(Debug, Clone)]
pub struct TransferWatcher {
    connection_timeout: Duration,
    max_reconnect_attempts: u32,
    reconnect_delay: Duration,
    channel_buffer_size: usize,
}

impl TransferWatcher {
    pub fn new(
        connection_timeout: Duration,
        max_reconnect_attempts: u32,
        reconnect_delay: Duration,
        channel_buffer_size: usize,
    ) -> Self {
        Self { connection_timeout, max_reconnect_attempts, reconnect_delay, channel_buffer_size }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.ws_connection_timeout(),
            config.max_reconnect_attempts,
            config.reconnect_delay(),
            config.channel_buffer_size,
        )
    }

    /// Start watching `Transfer` logs of `token`.
    /// The watch ends when the returned receiver is dropped.
    pub fn subscribe_transfers(
        &self,
        wss_url: String,
        network: NetworkId,
        token: Address,
        from: Option<Address>,
        to: Option<Address>,
    ) -> SyncResult<mpsc::Receiver<TransferEvent>> {
        Url::parse(&wss_url).map_err(|e| eyre!("Invalid WebSocket URL {}: {}", wss_url, e))?;

        let (event_tx, event_rx) = mpsc::channel(self.channel_buffer_size);
        let filter = TransferFilter { network, token, from, to };
        let watcher = self.clone();

        tokio::spawn(async move {
            let mut reconnects = ReconnectBudget::new(watcher.max_reconnect_attempts);

            loop {
                if event_tx.is_closed() {
                    debug!("Transfer receiver for {} dropped before reconnecting", filter.token);
                    break;
                }
                match Self::connect_and_subscribe(&wss_url, watcher.connection_timeout, &filter, &event_tx, &mut reconnects)
                    .await
                {
                    Ok(()) => {
                        info!("Transfer watch for {} on network {} ended", filter.token, filter.network);
                        break;
                    }
                    Err(e) => {
                        error!("Transfer watch connection error: {}", e);

                        let Some(attempt) = reconnects.next_attempt() else {
                            error!("Max reconnection attempts reached for {}, giving up", filter.token);
                            break;
                        };

                        warn!("Attempting reconnection #{} in {:?}", attempt, watcher.reconnect_delay);
                        sleep(watcher.reconnect_delay).await;
                    }
                }
            }
        });

        Ok(event_rx)
    }

    /// Connect to WebSocket and handle subscription
    async fn connect_and_subscribe(
        wss_url: &str,
        connection_timeout: Duration,
        filter: &TransferFilter,
        event_tx: &mpsc::Sender<TransferEvent>,
        reconnects: &mut ReconnectBudget,
    ) -> Result<()> {
        let url = Url::parse(wss_url)?;
        debug!("Connecting to WebSocket: {}", url);

        let (ws_stream, _) = timeout(connection_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| eyre!("WebSocket connection timeout"))?
            .map_err(|e| eyre!("WebSocket connection failed: {}", e))?;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        ws_sender.send(Message::Text(filter.subscribe_request().to_string().into())).await?;

        // Wait for subscription confirmation
        let subscription_id = match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                let response: Value = serde_json::from_str(text.as_str())?;
                if let Some(result) = response.get("result") {
                    result.as_str().ok_or_else(|| eyre!("Invalid subscription ID format"))?.to_string()
                } else if let Some(error) = response.get("error") {
                    return Err(eyre!("Subscription error: {}", error));
                } else {
                    return Err(eyre!("Unexpected subscription response: {}", text));
                }
            }
            Some(Ok(msg)) => {
                return Err(eyre!("Unexpected message type during subscription: {:?}", msg));
            }
            Some(Err(e)) => {
                return Err(eyre!("WebSocket error during subscription: {}", e));
            }
            None => {
                return Err(eyre!("WebSocket closed during subscription"));
            }
        };

        info!("Watching transfers of {} on network {} (subscription {})", filter.token, filter.network, subscription_id);
        reconnects.clear();

        loop {
            tokio::select! {
                ws_msg = ws_receiver.next() => {
                    match ws_msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(e) = Self::handle_message(text.as_str(), filter.network, event_tx) {
                                warn!("Failed to handle WebSocket message: {}", e);
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            return Err(eyre!("WebSocket closed by server"));
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                return Err(eyre!("Failed to send pong: {}", e));
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(eyre!("WebSocket error: {}", e));
                        }
                        None => {
                            return Err(eyre!("WebSocket stream ended"));
                        }
                    }
                }

                // Consumer went away
                _ = event_tx.closed() => {
                    debug!("Transfer receiver dropped, closing subscription {}", subscription_id);
                    break;
                }
            }
        }

        Ok(())
    }

    fn handle_message(text: &str, network: NetworkId, event_tx: &mpsc::Sender<TransferEvent>) -> Result<()> {
        let message: Value = serde_json::from_str(text)?;

        let Some(result) = message.get("params").and_then(|params| params.get("result")) else {
            return Ok(());
        };

        let log: RawLog = serde_json::from_value(result.clone())?;
        let Some(transfer) = log.to_transfer(network) else {
            return Ok(());
        };

        debug!("Transfer of {} on {}: {} -> {}", transfer.value, transfer.token, transfer.from, transfer.to);

        if let Err(e) = event_tx.try_send(transfer) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!("Transfer channel is full, dropping notification");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    return Err(eyre!("Transfer channel is closed"));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer_log(from: Address, to: Address, value: u64) -> RawLog {
        RawLog {
            address: Address::repeat_byte(0xaa),
            topics: vec![IERC20::Transfer::SIGNATURE_HASH, from.into_word(), to.into_word()],
            data: U256::from(value).to_be_bytes::<32>().to_vec().into(),
            block_number: Some("0x1a2b".to_string()),
        }
    }

    #[test]
    fn test_transfer_log_decoding() {
        let from = Address::repeat_byte(0x01);
        let to = Address::repeat_byte(0x02);
        let transfer = transfer_log(from, to, 600).to_transfer(NetworkId(1)).unwrap();

        assert_eq!(transfer.token, Address::repeat_byte(0xaa));
        assert_eq!(transfer.from, from);
        assert_eq!(transfer.to, to);
        assert_eq!(transfer.value, U256::from(600));
        assert_eq!(transfer.block_number, Some(0x1a2b));
    }

    #[test]
    fn test_non_transfer_log_is_ignored() {
        let mut log = transfer_log(Address::ZERO, Address::ZERO, 1);
        log.topics[0] = B256::repeat_byte(0x55);
        assert!(log.to_transfer(NetworkId(1)).is_none());
    }

    #[test]
    fn test_subscribe_request_filters() {
        let wallet = Address::repeat_byte(0x09);
        let filter = TransferFilter { network: NetworkId(1), token: Address::repeat_byte(0xaa), from: None, to: Some(wallet) };
        let request = filter.subscribe_request();
        let topics = request["params"][1]["topics"].as_array().unwrap();

        assert_eq!(topics.len(), 3);
        assert!(topics[1].is_null());
        assert_eq!(topics[2].as_str().unwrap(), format!("{:#x}", wallet.into_word()));
    }

    #[test]
    fn test_handle_message_forwards_transfers() {
        let (tx, mut rx) = mpsc::channel(4);
        let log = transfer_log(Address::repeat_byte(0x01), Address::repeat_byte(0x02), 5);
        let message = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": { "subscription": "0x1", "result": log }
        });

        TransferWatcher::handle_message(&message.to_string(), NetworkId(1), &tx).unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.value, U256::from(5));
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let watcher = TransferWatcher::new(Duration::from_secs(1), 1, Duration::from_secs(1), 4);
        let result = watcher.subscribe_transfers("not a url".to_string(), NetworkId(1), Address::ZERO, None, None);
        assert!(result.is_err());
    }

    #[test]
    fn test_confirmed_subscription_restores_reconnect_budget() {
        let mut budget = ReconnectBudget::new(3);
        assert_eq!(budget.next_attempt(), Some(1));
        assert_eq!(budget.next_attempt(), Some(2));

        budget.clear();
        for _ in 0..10 {
            assert_eq!(budget.next_attempt(), Some(1));
            budget.clear();
        }

        assert_eq!(budget.next_attempt(), Some(1));
        assert_eq!(budget.next_attempt(), Some(2));
        assert_eq!(budget.next_attempt(), None);
    }
}
