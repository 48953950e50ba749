//! Local transaction contract consumed by the client proxy.
//!
//! The proxy never begins or finishes transactions itself. It joins the
//! caller's [`Transaction`] on first use and is driven through the
//! [`Participant`] outcome calls by whoever coordinates that transaction.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::client::{ClientError, TxnContext};

/// A local transaction as seen by a participant.
pub trait Transaction: Send + Sync + fmt::Debug {
    /// Identifier, unique among live local transactions.
    fn id(&self) -> u64;

    fn creation_time(&self) -> Instant;

    fn timeout(&self) -> Duration;

    /// Registers a participant. Fails if the transaction can no longer accept
    /// participants, e.g. because it was aborted.
    fn join(&self, participant: &str) -> Result<(), ClientError>;

    /// Marks the transaction aborted. The first cause wins.
    fn abort(&self, cause: ClientError);

    /// Why the transaction was aborted, if it was.
    fn abort_cause(&self) -> Option<ClientError>;

    fn is_aborted(&self) -> bool {
        self.abort_cause().is_some()
    }
}

/// Outcome calls of a transaction participant.
pub trait Participant: Send + Sync {
    /// Votes on the transaction. `Ok(true)` means read-only: the participant
    /// is finished and must not receive `commit` or `abort`.
    fn prepare(
        &self,
        ctx: &TxnContext,
        txn: &Arc<dyn Transaction>,
    ) -> impl Future<Output = Result<bool, ClientError>> + Send;

    /// Commits a prepared transaction.
    fn commit(
        &self,
        ctx: &TxnContext,
        txn: &Arc<dyn Transaction>,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    fn prepare_and_commit(
        &self,
        ctx: &TxnContext,
        txn: &Arc<dyn Transaction>,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    fn abort(
        &self,
        ctx: &TxnContext,
        txn: &Arc<dyn Transaction>,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;
}

/// A minimal in-process [`Transaction`].
#[derive(Debug)]
pub struct LocalTransaction {
    id: u64,
    created: Instant,
    timeout: Duration,
    state: Mutex<LocalState>,
}

#[derive(Debug, Default)]
struct LocalState {
    participants: Vec<String>,
    abort_cause: Option<ClientError>,
}

impl LocalTransaction {
    pub fn new(id: u64, timeout: Duration) -> Self {
        Self {
            id,
            created: Instant::now(),
            timeout,
            state: Mutex::new(LocalState::default()),
        }
    }

    /// Convenience constructor returning the transaction as a trait object.
    pub fn shared(id: u64, timeout: Duration) -> Arc<dyn Transaction> {
        Arc::new(Self::new(id, timeout))
    }

    /// Names of the participants that joined, in join order.
    pub fn participants(&self) -> Vec<String> {
        self.state.lock().participants.clone()
    }
}

impl Transaction for LocalTransaction {
    fn id(&self) -> u64 {
        self.id
    }

    fn creation_time(&self) -> Instant {
        self.created
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn join(&self, participant: &str) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        if state.abort_cause.is_some() {
            return Err(ClientError::IllegalState(format!(
                "transaction {} is aborted",
                self.id
            )));
        }
        if !state.participants.iter().any(|p| p == participant) {
            state.participants.push(participant.to_string());
        }
        Ok(())
    }

    fn abort(&self, cause: ClientError) {
        let mut state = self.state.lock();
        if state.abort_cause.is_none() {
            state.abort_cause = Some(cause);
        }
    }

    fn abort_cause(&self) -> Option<ClientError> {
        self.state.lock().abort_cause.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_is_idempotent() {
        let txn = LocalTransaction::new(1, Duration::from_secs(1));
        txn.join("store").unwrap();
        txn.join("store").unwrap();
        assert_eq!(txn.participants(), vec!["store".to_string()]);
    }

    #[test]
    fn test_first_abort_cause_wins() {
        let txn = LocalTransaction::new(1, Duration::from_secs(1));
        txn.abort(ClientError::ShutDown);
        txn.abort(ClientError::IllegalState("later".to_string()));

        assert!(matches!(txn.abort_cause(), Some(ClientError::ShutDown)));
        assert!(txn.join("store").is_err());
    }
}
