use crate::types::{EntityId, NetworkId};
use eyre::Report;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    // Remote reads
    #[error("remote read failed for {entity}: {reason}")]
    RemoteRead { entity: EntityId, reason: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Decode(String),

    // Missing services / session inputs
    #[error("no ledger services initialized for network {0}")]
    ServiceUnavailable(NetworkId),
    #[error("no active signer")]
    NoSigner,
    #[error("no spender configured for network {0}")]
    NoSpender(NetworkId),
    #[error("transaction submission is disabled for network {0}")]
    WritesDisabled(NetworkId),

    // Programming errors
    #[error("entity {0} is not registered")]
    UnknownEntity(EntityId),
    #[error("pipeline `{0}` is not subscribed")]
    NotSubscribed(&'static str),

    #[error(transparent)]
    InternalEyre(Report),
}

impl SyncError {
    pub fn remote_read(entity: EntityId, reason: impl ToString) -> Self {
        Self::RemoteRead { entity, reason: reason.to_string() }
    }

    /// Failures an adapter recovers from by emitting nothing for the entity.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::UnknownEntity(_))
    }
}

impl From<Report> for SyncError {
    fn from(error: Report) -> Self {
        Self::InternalEyre(error)
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(error: reqwest::Error) -> Self {
        Self::Transport(error.to_string())
    }
}

impl From<alloy_sol_types::Error> for SyncError {
    fn from(error: alloy_sol_types::Error) -> Self {
        Self::Decode(error.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
