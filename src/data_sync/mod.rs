/// Data Synchronization Layer
///
/// Keeps per-entity facts (balances, pool fees, spot-derived APR and the facts derived
/// from them) synchronized with a remote ledger across several networks:
///
/// - Entity registry with one watch cell per entity and fact
/// - Source adapters: bootstrap fetch, transfer-driven change listener, interval poll
/// - One aggregation pipeline per fact with a quiescence window before publishing
/// - Derived chains joining registry and session cells
/// - Consumer bindings sharing a single source per cell
///
/// Every remote read goes through a `LedgerClient`, so observers never add reads.

// Core data sync components
pub mod config;
pub mod network_config;
pub mod registry;
pub mod session;
pub mod lifecycle;
pub mod binding;
pub mod adapters;
pub mod aggregator;
pub mod derived;
pub mod writes;
pub mod service;

// Tests
#[cfg(test)]
mod tests;

// Re-export main components for easy usage
pub use adapters::{Cohort, EntityReader, SourceAdapter};
pub use aggregator::{Pipeline, PipelineStats, UpdateSink};
pub use binding::{Binding, ObserverHandle};
pub use config::SyncConfig;
pub use derived::{Computed, DerivedChain};
pub use lifecycle::{Lifecycle, Subscription};
pub use network_config::{LedgerSyncConfigRoot, NetworkConfig, PoolConfig, RegistryConfig};
pub use registry::{CellMap, ChangeFeed, EntityRegistry, EntityState, NetworkInfo};
pub use service::{SyncService, SyncServiceBuilder};
pub use session::{Session, SessionCell};
pub use writes::{ApproveRequest, DepositRequest, WriteTriggers};
