use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning of the synchronization layer.
///
/// Quiescence windows and poll periods are per fact: balances move often and are
/// cheap to read, fee configuration almost never changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period before a burst of balance updates is published
    pub balance_quiescence_ms: u64,
    /// Quiet period before fee updates are published
    pub fee_quiescence_ms: u64,
    /// Quiet period before APR updates are published
    pub apr_quiescence_ms: u64,
    /// Quiet period before write status transitions are published
    pub tx_status_quiescence_ms: u64,
    /// Re-poll period for balances of the active network
    pub balance_poll_secs: u64,
    /// Re-poll period for pool fee configuration
    pub fee_poll_secs: u64,
    /// Re-poll period for spot-derived APR
    pub apr_poll_secs: u64,
    /// Buffer size of adapter -> pipeline channels
    pub channel_buffer_size: usize,
    /// Timeout for HTTP requests in seconds
    pub http_timeout_secs: u64,
    /// WebSocket connection timeout in seconds
    pub ws_connection_timeout_secs: u64,
    /// Maximum number of reconnection attempts
    pub max_reconnect_attempts: u32,
    /// Delay between reconnection attempts in seconds
    pub reconnect_delay_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            balance_quiescence_ms: 300,
            fee_quiescence_ms: 500,
            apr_quiescence_ms: 500,
            tx_status_quiescence_ms: 50,
            balance_poll_secs: 30,
            fee_poll_secs: 300,
            apr_poll_secs: 60,
            channel_buffer_size: 256,
            http_timeout_secs: 10,
            ws_connection_timeout_secs: 30,
            max_reconnect_attempts: 5,
            reconnect_delay_secs: 2,
        }
    }
}

fn env_override<T>(name: &str, target: &mut T) -> eyre::Result<()>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(name) {
        *target = raw.parse().map_err(|e| eyre::eyre!("Invalid {}: {}", name, e))?;
    }
    Ok(())
}

impl SyncConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> eyre::Result<Self> {
        let mut config = Self::default();

        env_override("BALANCE_QUIESCENCE_MS", &mut config.balance_quiescence_ms)?;
        env_override("FEE_QUIESCENCE_MS", &mut config.fee_quiescence_ms)?;
        env_override("APR_QUIESCENCE_MS", &mut config.apr_quiescence_ms)?;
        env_override("TX_STATUS_QUIESCENCE_MS", &mut config.tx_status_quiescence_ms)?;
        env_override("BALANCE_POLL_SECS", &mut config.balance_poll_secs)?;
        env_override("FEE_POLL_SECS", &mut config.fee_poll_secs)?;
        env_override("APR_POLL_SECS", &mut config.apr_poll_secs)?;
        env_override("CHANNEL_BUFFER_SIZE", &mut config.channel_buffer_size)?;
        env_override("HTTP_TIMEOUT_SECS", &mut config.http_timeout_secs)?;
        env_override("WS_CONNECTION_TIMEOUT_SECS", &mut config.ws_connection_timeout_secs)?;
        env_override("MAX_RECONNECT_ATTEMPTS", &mut config.max_reconnect_attempts)?;
        env_override("RECONNECT_DELAY_SECS", &mut config.reconnect_delay_secs)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> eyre::Result<()> {
        if self.channel_buffer_size == 0 {
            return Err(eyre::eyre!("channel_buffer_size must be positive"));
        }
        for (name, secs) in [
            ("balance_poll_secs", self.balance_poll_secs),
            ("fee_poll_secs", self.fee_poll_secs),
            ("apr_poll_secs", self.apr_poll_secs),
        ] {
            if secs == 0 {
                return Err(eyre::eyre!("{} must be positive", name));
            }
        }
        Ok(())
    }

    pub fn balance_quiescence(&self) -> Duration {
        Duration::from_millis(self.balance_quiescence_ms)
    }

    pub fn fee_quiescence(&self) -> Duration {
        Duration::from_millis(self.fee_quiescence_ms)
    }

    pub fn apr_quiescence(&self) -> Duration {
        Duration::from_millis(self.apr_quiescence_ms)
    }

    pub fn tx_status_quiescence(&self) -> Duration {
        Duration::from_millis(self.tx_status_quiescence_ms)
    }

    pub fn balance_poll_period(&self) -> Duration {
        Duration::from_secs(self.balance_poll_secs)
    }

    pub fn fee_poll_period(&self) -> Duration {
        Duration::from_secs(self.fee_poll_secs)
    }

    pub fn apr_poll_period(&self) -> Duration {
        Duration::from_secs(self.apr_poll_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn ws_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_connection_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.balance_quiescence_ms, 300);
        assert_eq!(config.balance_poll_secs, 30);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_durations() {
        let config = SyncConfig::default();
        assert_eq!(config.balance_quiescence(), Duration::from_millis(300));
        assert_eq!(config.apr_poll_period(), Duration::from_secs(60));
        assert_eq!(config.http_timeout(), Duration::from_secs(10));
        assert_eq!(config.reconnect_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_zero_poll_period_is_invalid() {
        let config = SyncConfig { fee_poll_secs: 0, ..SyncConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SyncConfig = toml::from_str("balance_quiescence_ms = 100").unwrap();
        assert_eq!(config.balance_quiescence_ms, 100);
        assert_eq!(config.fee_poll_secs, 300);
    }
}
