// Synchronization engine
pub mod data_sync;
// Upstream ledger clients
pub mod ledger;

// Common utilities and types
pub mod error;
pub mod types;
pub mod utils;

// Re-export key components
pub use data_sync::{
    ApproveRequest, Binding, DepositRequest, EntityRegistry, Lifecycle, RegistryConfig, SyncConfig, SyncService,
    SyncServiceBuilder,
};
pub use error::{SyncError, SyncResult};
pub use ledger::{LedgerClient, MockLedger, ReadOnly, RpcLedgerClient, TxSubmitter};
pub use types::{Apr, ApprovalRequirement, Entity, EntityId, EntityKind, FeeSet, NetworkId, TxStatus};
