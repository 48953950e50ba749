use std::sync::Arc;
use std::time::Duration;

use crate::config::ConfigError;
use crate::error::StoreError;
use crate::protocol::ProtocolError;

/// Errors surfaced by the store client.
///
/// Cloneable so the same value can be returned to the caller and recorded as
/// the local transaction's abort cause.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// A failure reported by the server.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The transport failed or the server's response could not be decoded.
    /// Always aborts the transaction.
    #[error("network failure: {0}")]
    Network(Arc<ProtocolError>),
    #[error("transaction {txn_id} timed out after {elapsed:?} (timeout {timeout:?})")]
    Timeout {
        txn_id: u64,
        elapsed: Duration,
        timeout: Duration,
    },
    /// The context is bound to a different local transaction.
    #[error("wrong transaction: context is bound to {bound}, got {found}")]
    WrongTransaction { bound: u64, found: u64 },
    #[error("store client is shut down")]
    ShutDown,
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        ClientError::Network(Arc::new(e))
    }
}

impl ClientError {
    /// Whether this failure ends the transaction it happened in.
    pub fn aborts_transaction(&self) -> bool {
        match self {
            ClientError::Network(_) | ClientError::Timeout { .. } => true,
            ClientError::Store(StoreError::TransactionNotActive(_)) => true,
            ClientError::Store(e) => e.is_aborting(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aborting_kinds() {
        assert!(ClientError::from(ProtocolError::ConnectionClosed).aborts_transaction());
        assert!(ClientError::Store(StoreError::TransactionConflict("x".into())).aborts_transaction());
        assert!(ClientError::Store(StoreError::TransactionNotActive("x".into())).aborts_transaction());
        assert!(!ClientError::Store(StoreError::ObjectNotFound("x".into())).aborts_transaction());
        assert!(!ClientError::ShutDown.aborts_transaction());
    }
}
