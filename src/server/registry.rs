use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::StoreError;
use crate::store::Txn;
use crate::types::Tid;

/// A registry of in-flight server transactions.
///
/// Maps each tid to its transaction and an in-use marker. Every operation that
/// touches store state under a tid holds a [`TxnLease`] for the duration of
/// the call, so the reaper never aborts a transaction that is being worked on.
///
/// The lock is held only for single map operations, never across a store
/// call. Entries are ordered by tid, and tids grow with creation time.
pub struct TxnRegistry {
    txns: Mutex<BTreeMap<Tid, TxnEntry>>,
}

struct TxnEntry {
    txn: Arc<Txn>,
    /// Number of outstanding leases.
    in_use: u32,
}

impl Default for TxnRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnRegistry {
    pub fn new() -> Self {
        Self {
            txns: Mutex::new(BTreeMap::new()),
        }
    }

    /// Registers a new transaction.
    pub fn insert(&self, txn: Txn) -> Arc<Txn> {
        let txn = Arc::new(txn);
        self.txns.lock().insert(
            txn.tid(),
            TxnEntry {
                txn: txn.clone(),
                in_use: 0,
            },
        );
        txn
    }

    /// Looks up a transaction and marks it in use until the lease is dropped.
    ///
    /// Fails with `TransactionNotActive` if the tid is unknown.
    pub fn get(&self, tid: Tid) -> Result<TxnLease<'_>, StoreError> {
        let mut txns = self.txns.lock();
        let entry = txns.get_mut(&tid).ok_or_else(|| StoreError::not_active(tid))?;
        entry.in_use += 1;
        Ok(TxnLease {
            registry: self,
            txn: entry.txn.clone(),
        })
    }

    /// Removes a finished transaction.
    pub fn remove(&self, tid: Tid) -> Option<Arc<Txn>> {
        self.txns.lock().remove(&tid).map(|entry| entry.txn)
    }

    /// Removes the transaction only if nobody holds a lease on it.
    pub fn remove_if_idle(&self, tid: Tid) -> Option<Arc<Txn>> {
        let mut txns = self.txns.lock();
        match txns.get(&tid) {
            Some(entry) if entry.in_use == 0 => txns.remove(&tid).map(|entry| entry.txn),
            _ => None,
        }
    }

    /// Returns the idle transactions that outlived their own timeout or
    /// `timeout`, whichever is shorter.
    ///
    /// Per-transaction timeouts differ, so a young entry does not end the scan.
    pub fn scan_expired(&self, now: Instant, timeout: Duration) -> Vec<Arc<Txn>> {
        let txns = self.txns.lock();
        txns.values()
            .filter(|entry| entry.in_use == 0)
            .filter(|entry| entry.txn.is_older_than(now, entry.txn.timeout().min(timeout)))
            .map(|entry| entry.txn.clone())
            .collect()
    }

    pub fn contains(&self, tid: Tid) -> bool {
        self.txns.lock().contains_key(&tid)
    }

    pub fn is_in_use(&self, tid: Tid) -> bool {
        self.txns
            .lock()
            .get(&tid)
            .is_some_and(|entry| entry.in_use > 0)
    }

    pub fn len(&self) -> usize {
        self.txns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.txns.lock().is_empty()
    }

    fn not_in_use(&self, tid: Tid) {
        if let Some(entry) = self.txns.lock().get_mut(&tid) {
            entry.in_use = entry.in_use.saturating_sub(1);
        }
    }
}

/// Scoped in-use marker for a registered transaction.
pub struct TxnLease<'a> {
    registry: &'a TxnRegistry,
    txn: Arc<Txn>,
}

impl TxnLease<'_> {
    pub fn txn(&self) -> &Arc<Txn> {
        &self.txn
    }
}

impl Drop for TxnLease<'_> {
    fn drop(&mut self) {
        self.registry.not_in_use(self.txn.tid());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(registry: &TxnRegistry, tid: u64) -> Arc<Txn> {
        registry.insert(Txn::new(Tid::new(tid), Duration::from_secs(60)))
    }

    #[test]
    fn test_get_unknown_tid() {
        let registry = TxnRegistry::new();
        assert!(matches!(
            registry.get(Tid::new(7)),
            Err(StoreError::TransactionNotActive(_))
        ));
    }

    #[test]
    fn test_lease_marks_in_use_until_dropped() {
        let registry = TxnRegistry::new();
        register(&registry, 1);

        let lease = registry.get(Tid::new(1)).unwrap();
        assert!(registry.is_in_use(Tid::new(1)));
        assert_eq!(lease.txn().tid(), Tid::new(1));

        drop(lease);
        assert!(!registry.is_in_use(Tid::new(1)));
    }

    #[test]
    fn test_overlapping_leases() {
        let registry = TxnRegistry::new();
        register(&registry, 1);

        let first = registry.get(Tid::new(1)).unwrap();
        let second = registry.get(Tid::new(1)).unwrap();
        drop(first);
        assert!(registry.is_in_use(Tid::new(1)));
        drop(second);
        assert!(!registry.is_in_use(Tid::new(1)));
    }

    #[test]
    fn test_remove_while_leased() {
        let registry = TxnRegistry::new();
        register(&registry, 1);

        let lease = registry.get(Tid::new(1)).unwrap();
        assert!(registry.remove(Tid::new(1)).is_some());
        drop(lease);

        assert!(!registry.contains(Tid::new(1)));
        assert!(registry.remove(Tid::new(1)).is_none());
    }

    #[test]
    fn test_scan_expired_skips_leased_transactions() {
        let registry = TxnRegistry::new();
        register(&registry, 1);
        register(&registry, 2);
        register(&registry, 3);

        let _lease = registry.get(Tid::new(2)).unwrap();
        let later = Instant::now() + Duration::from_secs(10);
        let expired: Vec<Tid> = registry
            .scan_expired(later, Duration::from_secs(1))
            .iter()
            .map(|txn| txn.tid())
            .collect();

        assert_eq!(expired, vec![Tid::new(1), Tid::new(3)]);
    }

    #[test]
    fn test_scan_expired_ignores_young_transactions() {
        let registry = TxnRegistry::new();
        register(&registry, 1);

        let expired = registry.scan_expired(Instant::now(), Duration::from_secs(60));
        assert!(expired.is_empty());
    }

    #[test]
    fn test_scan_expired_uses_shorter_transaction_timeout() {
        let registry = TxnRegistry::new();
        register(&registry, 1);
        registry.insert(Txn::new(Tid::new(2), Duration::from_millis(100)));
        register(&registry, 3);

        let later = Instant::now() + Duration::from_secs(1);
        let expired: Vec<Tid> = registry
            .scan_expired(later, Duration::from_secs(600))
            .iter()
            .map(|txn| txn.tid())
            .collect();

        assert_eq!(expired, vec![Tid::new(2)]);
    }

    #[test]
    fn test_remove_if_idle() {
        let registry = TxnRegistry::new();
        register(&registry, 1);

        let lease = registry.get(Tid::new(1)).unwrap();
        assert!(registry.remove_if_idle(Tid::new(1)).is_none());
        drop(lease);
        assert!(registry.remove_if_idle(Tid::new(1)).is_some());
        assert!(registry.is_empty());
    }
}
