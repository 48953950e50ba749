use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::ClientError;
use crate::txn::Transaction;
use crate::types::Tid;

/// Binds one local transaction to its server-side tid.
///
/// A context belongs to one logical caller (a task or session) and is passed
/// explicitly to every store call that caller makes. It holds at most one
/// binding at a time: the first call under a transaction creates it and the
/// transaction's outcome clears it.
///
/// Concurrent first calls on one context create a single server transaction:
/// joins are serialized by `joining`.
#[derive(Default)]
pub struct TxnContext {
    info: Mutex<Option<TxnInfo>>,
    joining: tokio::sync::Mutex<()>,
}

pub(crate) struct TxnInfo {
    pub(crate) txn: Arc<dyn Transaction>,
    pub(crate) tid: Tid,
    pub(crate) prepared: bool,
    /// The server already discarded the transaction; `abort` needs no round trip.
    pub(crate) server_aborted: bool,
}

impl TxnContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tid of the bound transaction, if any.
    pub fn tid(&self) -> Option<Tid> {
        self.info.lock().as_ref().map(|info| info.tid)
    }

    pub fn is_bound(&self) -> bool {
        self.info.lock().is_some()
    }

    pub fn is_prepared(&self) -> bool {
        self.info.lock().as_ref().is_some_and(|info| info.prepared)
    }

    /// Tid bound to `txn`, or `None` if the context is free.
    pub(crate) fn bound_tid(&self, txn: &dyn Transaction) -> Result<Option<Tid>, ClientError> {
        match self.info.lock().as_ref() {
            Some(info) => check_same(info, txn).map(|()| Some(info.tid)),
            None => Ok(None),
        }
    }

    /// Held while a call creates the server transaction for this context.
    pub(crate) async fn lock_join(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.joining.lock().await
    }

    pub(crate) fn bind(&self, txn: Arc<dyn Transaction>, tid: Tid) {
        *self.info.lock() = Some(TxnInfo {
            txn,
            tid,
            prepared: false,
            server_aborted: false,
        });
    }

    /// Runs `f` on the binding for `txn`. Fails if the context is free or
    /// bound to another transaction.
    pub(crate) fn with_joined<T>(
        &self,
        txn: &dyn Transaction,
        f: impl FnOnce(&mut TxnInfo) -> Result<T, ClientError>,
    ) -> Result<T, ClientError> {
        let mut info = self.info.lock();
        let info = info.as_mut().ok_or_else(|| {
            ClientError::IllegalState(format!("transaction {} has not joined the store", txn.id()))
        })?;
        check_same(info, txn)?;
        f(info)
    }

    /// Records that the server no longer knows the bound transaction.
    pub(crate) fn mark_server_aborted(&self, txn: &dyn Transaction) {
        if let Some(info) = self.info.lock().as_mut()
            && info.txn.id() == txn.id()
        {
            info.server_aborted = true;
        }
    }

    /// Removes the binding for `txn`.
    pub(crate) fn take(&self, txn: &dyn Transaction) -> Result<Option<TxnInfo>, ClientError> {
        let mut info = self.info.lock();
        if let Some(bound) = info.as_ref() {
            check_same(bound, txn)?;
        }
        Ok(info.take())
    }
}

fn check_same(info: &TxnInfo, txn: &dyn Transaction) -> Result<(), ClientError> {
    if info.txn.id() == txn.id() {
        Ok(())
    } else {
        Err(ClientError::WrongTransaction {
            bound: info.txn.id(),
            found: txn.id(),
        })
    }
}

impl fmt::Debug for TxnContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.info.lock();
        match info.as_ref() {
            Some(info) => f
                .debug_struct("TxnContext")
                .field("txn", &info.txn.id())
                .field("tid", &info.tid)
                .field("prepared", &info.prepared)
                .field("server_aborted", &info.server_aborted)
                .finish(),
            None => f.write_str("TxnContext(unbound)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::txn::LocalTransaction;

    #[test]
    fn test_binding_lifecycle() {
        let ctx = TxnContext::new();
        let txn = LocalTransaction::shared(1, Duration::from_secs(1));
        assert_eq!(ctx.bound_tid(txn.as_ref()).unwrap(), None);

        ctx.bind(txn.clone(), Tid::new(7));
        assert_eq!(ctx.bound_tid(txn.as_ref()).unwrap(), Some(Tid::new(7)));
        assert_eq!(ctx.tid(), Some(Tid::new(7)));

        let info = ctx.take(txn.as_ref()).unwrap().unwrap();
        assert_eq!(info.tid, Tid::new(7));
        assert!(!ctx.is_bound());
    }

    #[test]
    fn test_wrong_transaction() {
        let ctx = TxnContext::new();
        ctx.bind(LocalTransaction::shared(1, Duration::from_secs(1)), Tid::new(7));

        let other = LocalTransaction::shared(2, Duration::from_secs(1));
        assert!(matches!(
            ctx.bound_tid(other.as_ref()),
            Err(ClientError::WrongTransaction { bound: 1, found: 2 })
        ));
        assert!(ctx.take(other.as_ref()).is_err());
        assert!(ctx.is_bound());
    }

    #[test]
    fn test_with_joined_requires_binding() {
        let ctx = TxnContext::new();
        let txn = LocalTransaction::shared(1, Duration::from_secs(1));
        let result = ctx.with_joined(txn.as_ref(), |info| Ok(info.tid));
        assert!(matches!(result, Err(ClientError::IllegalState(_))));
    }
}
