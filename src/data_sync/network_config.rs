use super::config::SyncConfig;
use crate::ledger::NetworkEndpoint;
use crate::types::NetworkId;
use crate::utils::config_loader::{
    LoadConfigError, SyncConfigLoader, SyncConfigLoaderSync, load_from_file, load_from_file_sync,
};
use crate::utils::constants::MULTICALL3;
use alloy_primitives::Address;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;

#[derive(Clone, Deserialize, Debug)]
pub struct LedgerSyncConfigRoot {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
}

#[derive(Clone, Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    pub address: Address,
    pub tokens: Vec<Address>,
}

#[derive(Clone, Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_http_url: String,
    #[serde(default)]
    pub rpc_wss_url: Option<String>,
    #[serde(default = "default_multicall")]
    pub multicall_address: Option<Address>,
    /// Contract that spends user tokens on deposit
    #[serde(default)]
    pub spender: Option<Address>,
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
}

fn default_multicall() -> Option<Address> {
    Some(MULTICALL3)
}

impl NetworkConfig {
    pub fn network_id(&self) -> NetworkId {
        NetworkId(self.chain_id)
    }

    pub fn endpoint(&self) -> NetworkEndpoint {
        NetworkEndpoint {
            http_url: self.rpc_http_url.clone(),
            wss_url: self.rpc_wss_url.clone(),
            multicall_address: self.multicall_address,
        }
    }
}

/// Static description of every network, pool and token the registry tracks.
#[derive(Clone, Deserialize, Debug, Default)]
pub struct RegistryConfig {
    pub networks: Vec<NetworkConfig>,
}

impl RegistryConfig {
    pub fn new(networks: Vec<NetworkConfig>) -> Self {
        Self { networks }
    }

    pub fn validate(&self) -> Result<(), LoadConfigError> {
        let mut seen = HashSet::new();
        for network in &self.networks {
            if !seen.insert(network.chain_id) {
                return Err(LoadConfigError::ConfigError(format!("duplicate network {}", network.chain_id)));
            }
            if network.pools.iter().any(|pool| pool.tokens.is_empty()) {
                return Err(LoadConfigError::ConfigError(format!(
                    "network {} has a pool without tokens",
                    network.chain_id
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SyncConfigLoader for RegistryConfig {
    type SectionType = RegistryConfig;

    async fn load_section_from_file(file_name: String) -> Result<Self::SectionType, LoadConfigError> {
        let root: LedgerSyncConfigRoot = load_from_file(file_name).await?;
        let config = RegistryConfig::new(root.networks);
        config.validate()?;
        Ok(config)
    }
}

impl SyncConfigLoaderSync for RegistryConfig {
    type SectionType = RegistryConfig;

    fn load_section_from_file_sync(file_name: String) -> Result<Self::SectionType, LoadConfigError> {
        let root: LedgerSyncConfigRoot = load_from_file_sync(file_name)?;
        let config = RegistryConfig::new(root.networks);
        config.validate()?;
        Ok(config)
    }
}

impl SyncConfigLoaderSync for SyncConfig {
    type SectionType = SyncConfig;

    fn load_section_from_file_sync(file_name: String) -> Result<Self::SectionType, LoadConfigError> {
        let root: LedgerSyncConfigRoot = load_from_file_sync(file_name)?;
        root.sync.validate().map_err(|e| LoadConfigError::ConfigError(e.to_string()))?;
        Ok(root.sync)
    }
}
