use super::EntityReader;
use crate::data_sync::session::Session;
use crate::error::{SyncError, SyncResult};
use crate::ledger::LedgerClient;
use crate::types::{Apr, EntityId, FeeSet};
use alloy_primitives::U256;
use async_trait::async_trait;
use std::sync::Arc;

/// Token balance of the active signer.
#[derive(Clone)]
pub struct BalanceReader {
    ledger: Arc<dyn LedgerClient>,
    session: Session,
}

impl BalanceReader {
    pub fn new(ledger: Arc<dyn LedgerClient>, session: Session) -> Self {
        Self { ledger, session }
    }
}

#[async_trait]
impl EntityReader<U256> for BalanceReader {
    async fn read(&self, id: EntityId) -> SyncResult<U256> {
        let wallet = self.session.signer().ok_or(SyncError::NoSigner)?;
        self.ledger.read_balance(id.network, id.address, wallet).await
    }
}

/// Pool fee configuration.
#[derive(Clone)]
pub struct FeeReader {
    ledger: Arc<dyn LedgerClient>,
}

impl FeeReader {
    pub fn new(ledger: Arc<dyn LedgerClient>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl EntityReader<FeeSet> for FeeReader {
    async fn read(&self, id: EntityId) -> SyncResult<FeeSet> {
        self.ledger.read_fee_config(id.network, id.address).await
    }
}

/// Spot-price derived APR of a pool.
#[derive(Clone)]
pub struct AprReader {
    ledger: Arc<dyn LedgerClient>,
}

impl AprReader {
    pub fn new(ledger: Arc<dyn LedgerClient>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl EntityReader<Apr> for AprReader {
    async fn read(&self, id: EntityId) -> SyncResult<Apr> {
        self.ledger.read_spot_derived_apr(id.network, id.address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MockLedger;
    use alloy_primitives::Address;

    #[tokio::test]
    async fn test_balance_reader_requires_signer() {
        let ledger = Arc::new(MockLedger::new());
        let id = EntityId::new(1, Address::repeat_byte(0x01));
        ledger.set_balance(id, U256::from(10u64));

        let session = Session::new();
        let reader = BalanceReader::new(ledger.clone(), session.clone());
        assert!(matches!(reader.read(id).await, Err(SyncError::NoSigner)));
        assert_eq!(ledger.balance_reads(), 0);

        session.set_signer(Some(Address::repeat_byte(0x77)));
        assert_eq!(reader.read(id).await.unwrap(), U256::from(10));
    }
}
