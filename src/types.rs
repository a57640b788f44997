use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use strum_macros::{Display as StrumDisplay, EnumString};

/// EVM chain id of a network the registry tracks.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkId(pub u64);

impl Display for NetworkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NetworkId {
    fn from(chain_id: u64) -> Self {
        Self(chain_id)
    }
}

/// Composite key of a tracked on-chain object: the network it lives on and its address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    pub network: NetworkId,
    pub address: Address,
}

impl EntityId {
    pub fn new(network: impl Into<NetworkId>, address: Address) -> Self {
        Self { network: network.into(), address }
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.address, self.network)
    }
}

/// Complete key -> value view of one fact at a point in time.
pub type SnapshotMap<T> = HashMap<EntityId, T>;

/// Values that can live in a registry cell or flow through a pipeline.
pub trait CellValue: Clone + PartialEq + Debug + Send + Sync + 'static {}

impl<T> CellValue for T where T: Clone + PartialEq + Debug + Send + Sync + 'static {}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, StrumDisplay, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Token,
    Pool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenEntity {
    pub id: EntityId,
    /// Pools on the same network that reference this token.
    pub pools: Vec<Address>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolEntity {
    pub id: EntityId,
    pub tokens: Vec<Address>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Entity {
    Token(TokenEntity),
    Pool(PoolEntity),
}

impl Entity {
    pub fn id(&self) -> EntityId {
        match self {
            Entity::Token(token) => token.id,
            Entity::Pool(pool) => pool.id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Token(_) => EntityKind::Token,
            Entity::Pool(_) => EntityKind::Pool,
        }
    }
}

/// Fee configuration of a pool, in basis points.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSet {
    pub lp_fee_bps: u32,
    pub protocol_fee_bps: u32,
}

impl FeeSet {
    pub fn total_bps(&self) -> u32 {
        self.lp_fee_bps.saturating_add(self.protocol_fee_bps)
    }

    /// Total fee in percentage points.
    pub fn total_percent(&self) -> f64 {
        self.total_bps() as f64 / 100.0
    }
}

/// Annualised rate in percent. Negative when the pool trades above par.
#[derive(Copy, Clone, Debug, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Apr(pub f64);

impl Apr {
    pub fn is_negative(&self) -> bool {
        self.0 < 0.0
    }
}

impl Display for Apr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}%", self.0)
    }
}

pub type TxHash = B256;

/// Progress of a write request, keyed by the entity it targets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Confirmed(TxHash),
    Failed(String),
}

impl TxStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, TxStatus::Pending)
    }
}

/// Whether spending a token requires an approval first.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ApprovalRequirement {
    /// Nothing to spend, so the allowance is never consulted.
    AlwaysApproved,
    Required { approved: bool, amount: U256 },
}

impl ApprovalRequirement {
    pub fn from_allowance(balance: U256, allowance: U256) -> Self {
        ApprovalRequirement::Required { approved: allowance > balance, amount: allowance }
    }

    pub fn needs_approval(&self) -> bool {
        match self {
            ApprovalRequirement::AlwaysApproved => false,
            ApprovalRequirement::Required { approved, .. } => !approved,
        }
    }
}

/// ERC-20 `Transfer` notification delivered by a ledger push channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferEvent {
    pub network: NetworkId,
    pub token: Address,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub block_number: Option<u64>,
}

impl TransferEvent {
    pub fn entity_id(&self) -> EntityId {
        EntityId::new(self.network, self.token)
    }
}
