use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::protocol::{Reply, Request, Response};
use crate::server::registry::{TxnLease, TxnRegistry};
use crate::store::{LocalStore, Txn};
use crate::types::{ClassId, IdWindow, ObjectId, Tid};

/// The remote operations of the store.
///
/// Every transactional call resolves its tid through the registry first,
/// holds the lease while the store works, and releases it whatever the
/// outcome. Failures come from the store unchanged; the only kind added here
/// is `TransactionNotActive` for unknown tids.
///
/// When the store reports that a transaction was aborted (for example after a
/// conflict), the transaction is aborted in the store and removed from the
/// registry right away, so the client does not need to send `abort`.
pub struct StoreService<S> {
    store: Arc<S>,
    registry: TxnRegistry,
    /// Cached block of transaction IDs.
    tids: Mutex<IdWindow>,
    /// Serializes refills of `tids`; never held while `tids` is locked.
    tid_refill: tokio::sync::Mutex<()>,
    tid_block_size: u64,
    default_txn_timeout: Duration,
}

impl<S: LocalStore> StoreService<S> {
    pub fn new(store: Arc<S>, tid_block_size: u64, default_txn_timeout: Duration) -> Self {
        Self {
            store,
            registry: TxnRegistry::new(),
            tids: Mutex::new(IdWindow::empty()),
            tid_refill: tokio::sync::Mutex::new(()),
            tid_block_size: tid_block_size.max(1),
            default_txn_timeout,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &TxnRegistry {
        &self.registry
    }

    /// Executes one decoded request and packs the outcome into a response.
    pub async fn handle(&self, request: Request) -> Response {
        let result = match request {
            Request::AllocateObjects { count } => self
                .allocate_objects(count)
                .await
                .map(|oid| Reply::Long(oid.as_u64())),
            Request::MarkForUpdate { tid, oid } => {
                self.mark_for_update(tid, oid).await.map(|()| Reply::Unit)
            }
            Request::GetObject {
                tid,
                oid,
                for_update,
            } => self
                .get_object(tid, oid, for_update)
                .await
                .map(Reply::Bytes),
            Request::SetObject { tid, oid, data } => {
                self.set_object(tid, oid, data).await.map(|()| Reply::Unit)
            }
            Request::SetObjects { tid, oids, data } => {
                self.set_objects(tid, oids, data).await.map(|()| Reply::Unit)
            }
            Request::RemoveObject { tid, oid } => {
                self.remove_object(tid, oid).await.map(|()| Reply::Unit)
            }
            Request::GetBinding { tid, name } => self
                .get_binding(tid, &name)
                .await
                .map(|oid| Reply::Long(oid.as_u64())),
            Request::SetBinding { tid, name, oid } => {
                self.set_binding(tid, &name, oid).await.map(|()| Reply::Unit)
            }
            Request::RemoveBinding { tid, name } => {
                self.remove_binding(tid, &name).await.map(|()| Reply::Unit)
            }
            Request::NextBoundName { tid, name } => self
                .next_bound_name(tid, name.as_deref())
                .await
                .map(Reply::Name),
            Request::GetClassId { tid, class_info } => self
                .get_class_id(tid, &class_info)
                .await
                .map(|id| Reply::Int(id.as_u32())),
            Request::GetClassInfo { tid, class_id } => self
                .get_class_info(tid, class_id)
                .await
                .map(Reply::Bytes),
            Request::CreateTransaction { timeout_ms } => self
                .create_transaction(timeout_ms)
                .await
                .map(|tid| Reply::Long(tid.as_u64())),
            Request::Prepare { tid } => self.prepare(tid).await.map(Reply::Bool),
            Request::Commit { tid } => self.commit(tid).await.map(|()| Reply::Unit),
            Request::PrepareAndCommit { tid } => {
                self.prepare_and_commit(tid).await.map(|()| Reply::Unit)
            }
            Request::Abort { tid } => self.abort(tid).await.map(|()| Reply::Unit),
        };
        Response::from(result)
    }

    /// Reserves `count` object IDs outside any client transaction.
    pub async fn allocate_objects(&self, count: i32) -> Result<ObjectId, StoreError> {
        let count = u32::try_from(count)
            .ok()
            .filter(|count| *count > 0)
            .ok_or_else(|| {
                StoreError::IllegalArgument(format!(
                    "object allocation count must be positive, got {}",
                    count
                ))
            })?;
        self.store.allocate_objects(count).await
    }

    /// Mints a tid and registers a new transaction under it.
    ///
    /// A non-positive timeout falls back to the server default, and no
    /// transaction outlives the server default.
    pub async fn create_transaction(&self, timeout_ms: i64) -> Result<Tid, StoreError> {
        let timeout = u64::try_from(timeout_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map_or(self.default_txn_timeout, Duration::from_millis)
            .min(self.default_txn_timeout);
        let tid = self.next_tid().await?;
        self.registry.insert(Txn::new(tid, timeout));
        debug!(%tid, ?timeout, "created transaction");
        Ok(tid)
    }

    async fn next_tid(&self) -> Result<Tid, StoreError> {
        let cached = self.tids.lock().take();
        if let Some(id) = cached {
            return Ok(Tid::new(id));
        }

        let _refill = self.tid_refill.lock().await;
        let cached = self.tids.lock().take();
        if let Some(id) = cached {
            return Ok(Tid::new(id));
        }
        let first = self.store.allocate_tids(self.tid_block_size).await?;

        let mut window = self.tids.lock();
        window.refill(first.as_u64(), self.tid_block_size);
        window
            .take()
            .map(Tid::new)
            .ok_or_else(|| StoreError::Internal("empty transaction ID block".to_string()))
    }

    pub async fn mark_for_update(&self, tid: Tid, oid: ObjectId) -> Result<(), StoreError> {
        let lease = self.registry.get(tid)?;
        let result = self.store.mark_for_update(lease.txn(), oid).await;
        self.settle(lease, result).await
    }

    pub async fn get_object(
        &self,
        tid: Tid,
        oid: ObjectId,
        for_update: bool,
    ) -> Result<Vec<u8>, StoreError> {
        let lease = self.registry.get(tid)?;
        let result = self.store.get_object(lease.txn(), oid, for_update).await;
        self.settle(lease, result).await
    }

    pub async fn set_object(&self, tid: Tid, oid: ObjectId, data: Vec<u8>) -> Result<(), StoreError> {
        let lease = self.registry.get(tid)?;
        let result = self.store.set_object(lease.txn(), oid, data).await;
        self.settle(lease, result).await
    }

    pub async fn set_objects(
        &self,
        tid: Tid,
        oids: Vec<ObjectId>,
        data: Vec<Vec<u8>>,
    ) -> Result<(), StoreError> {
        if oids.len() != data.len() {
            return Err(StoreError::IllegalArgument(format!(
                "{} object IDs but {} payloads",
                oids.len(),
                data.len()
            )));
        }
        let lease = self.registry.get(tid)?;
        let result = self.store.set_objects(lease.txn(), oids, data).await;
        self.settle(lease, result).await
    }

    pub async fn remove_object(&self, tid: Tid, oid: ObjectId) -> Result<(), StoreError> {
        let lease = self.registry.get(tid)?;
        let result = self.store.remove_object(lease.txn(), oid).await;
        self.settle(lease, result).await
    }

    pub async fn get_binding(&self, tid: Tid, name: &str) -> Result<ObjectId, StoreError> {
        let lease = self.registry.get(tid)?;
        let result = self.store.get_binding(lease.txn(), name).await;
        self.settle(lease, result).await
    }

    pub async fn set_binding(&self, tid: Tid, name: &str, oid: ObjectId) -> Result<(), StoreError> {
        let lease = self.registry.get(tid)?;
        let result = self.store.set_binding(lease.txn(), name, oid).await;
        self.settle(lease, result).await
    }

    pub async fn remove_binding(&self, tid: Tid, name: &str) -> Result<(), StoreError> {
        let lease = self.registry.get(tid)?;
        let result = self.store.remove_binding(lease.txn(), name).await;
        self.settle(lease, result).await
    }

    pub async fn next_bound_name(
        &self,
        tid: Tid,
        name: Option<&str>,
    ) -> Result<Option<String>, StoreError> {
        let lease = self.registry.get(tid)?;
        let result = self.store.next_bound_name(lease.txn(), name).await;
        self.settle(lease, result).await
    }

    pub async fn get_class_id(&self, tid: Tid, class_info: &[u8]) -> Result<ClassId, StoreError> {
        let lease = self.registry.get(tid)?;
        let result = self.store.get_class_id(lease.txn(), class_info).await;
        self.settle(lease, result).await
    }

    pub async fn get_class_info(&self, tid: Tid, class_id: ClassId) -> Result<Vec<u8>, StoreError> {
        let lease = self.registry.get(tid)?;
        let result = self.store.get_class_info(lease.txn(), class_id).await;
        self.settle(lease, result).await
    }

    /// Votes on the transaction. A read-only vote finishes it.
    pub async fn prepare(&self, tid: Tid) -> Result<bool, StoreError> {
        let lease = self.registry.get(tid)?;
        let result = self.store.prepare(lease.txn()).await;
        if let Ok(true) = result {
            self.registry.remove(tid);
            debug!(%tid, "read-only transaction finished at prepare");
        }
        self.settle(lease, result).await
    }

    pub async fn commit(&self, tid: Tid) -> Result<(), StoreError> {
        let lease = self.registry.get(tid)?;
        let result = self.store.commit(lease.txn()).await;
        if result.is_ok() {
            self.registry.remove(tid);
            debug!(%tid, "committed transaction");
        }
        self.settle(lease, result).await
    }

    pub async fn prepare_and_commit(&self, tid: Tid) -> Result<(), StoreError> {
        let lease = self.registry.get(tid)?;
        let result = self.store.prepare_and_commit(lease.txn()).await;
        if result.is_ok() {
            self.registry.remove(tid);
            debug!(%tid, "committed transaction");
        }
        self.settle(lease, result).await
    }

    /// Aborts the transaction. It leaves the registry even if the store fails.
    pub async fn abort(&self, tid: Tid) -> Result<(), StoreError> {
        let lease = self.registry.get(tid)?;
        let result = self.store.abort(lease.txn()).await;
        self.registry.remove(tid);
        drop(lease);
        debug!(%tid, "aborted transaction");
        result
    }

    /// Releases the lease and, if the store aborted the transaction, finishes
    /// it here as well.
    async fn settle<T>(
        &self,
        lease: TxnLease<'_>,
        result: Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let txn = lease.txn().clone();
        drop(lease);

        if let Err(e) = &result
            && e.is_aborting()
            && self.registry.remove(txn.tid()).is_some()
        {
            debug!(tid = %txn.tid(), error = %e, "store aborted transaction");
            if let Err(abort_error) = self.store.abort(&txn).await {
                warn!(tid = %txn.tid(), error = %abort_error, "failed to abort transaction in store");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn service() -> StoreService<MemoryStore> {
        StoreService::new(Arc::new(MemoryStore::new()), 4, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_tids_are_unique_across_refills() {
        let service = service();
        let mut tids = Vec::new();
        for _ in 0..10 {
            tids.push(service.create_transaction(1000).await.unwrap());
        }
        for pair in tids.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(service.registry().len(), 10);
    }

    #[tokio::test]
    async fn test_create_transaction_uses_requested_timeout() {
        let service = service();
        let tid = service.create_transaction(1500).await.unwrap();
        let lease = service.registry().get(tid).unwrap();
        assert_eq!(lease.txn().timeout(), Duration::from_millis(1500));
        drop(lease);

        let tid = service.create_transaction(0).await.unwrap();
        let lease = service.registry().get(tid).unwrap();
        assert_eq!(lease.txn().timeout(), Duration::from_secs(60));
        drop(lease);

        let tid = service.create_transaction(600_000).await.unwrap();
        let lease = service.registry().get(tid).unwrap();
        assert_eq!(lease.txn().timeout(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_unknown_tid_is_not_active() {
        let service = service();
        let result = service.get_object(Tid::new(99), ObjectId::new(1), false).await;
        assert!(matches!(result, Err(StoreError::TransactionNotActive(_))));
    }

    #[tokio::test]
    async fn test_allocate_objects_rejects_non_positive_count() {
        let service = service();
        assert!(matches!(
            service.allocate_objects(0).await,
            Err(StoreError::IllegalArgument(_))
        ));
        assert!(matches!(
            service.allocate_objects(-5).await,
            Err(StoreError::IllegalArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_outcomes_remove_transactions() {
        let service = service();

        let committed = service.create_transaction(1000).await.unwrap();
        service
            .set_object(committed, ObjectId::new(1), vec![1])
            .await
            .unwrap();
        assert!(!service.prepare(committed).await.unwrap());
        service.commit(committed).await.unwrap();
        assert!(!service.registry().contains(committed));

        let read_only = service.create_transaction(1000).await.unwrap();
        assert!(service.prepare(read_only).await.unwrap());
        assert!(!service.registry().contains(read_only));

        let aborted = service.create_transaction(1000).await.unwrap();
        service.abort(aborted).await.unwrap();
        assert!(matches!(
            service.abort(aborted).await,
            Err(StoreError::TransactionNotActive(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_operation_releases_lease() {
        let service = service();
        let tid = service.create_transaction(1000).await.unwrap();

        let result = service.get_object(tid, ObjectId::new(42), false).await;
        assert_eq!(
            result,
            Err(StoreError::ObjectNotFound("no object 42".to_string()))
        );
        assert!(service.registry().contains(tid));
        assert!(!service.registry().is_in_use(tid));
    }

    #[tokio::test]
    async fn test_conflict_finishes_losing_transaction() {
        let service = service();
        let winner = service.create_transaction(1000).await.unwrap();
        let loser = service.create_transaction(1000).await.unwrap();

        service.set_object(winner, ObjectId::new(1), vec![1]).await.unwrap();
        let result = service.set_object(loser, ObjectId::new(1), vec![2]).await;

        assert!(matches!(result, Err(StoreError::TransactionConflict(_))));
        assert!(!service.registry().contains(loser));
        assert!(service.registry().contains(winner));
    }

    #[tokio::test]
    async fn test_handle_packs_failures() {
        let service = service();
        let response = service
            .handle(Request::GetBinding {
                tid: Tid::new(5),
                name: "x".to_string(),
            })
            .await;
        assert!(matches!(
            response,
            Response::Failure(StoreError::TransactionNotActive(_))
        ));

        let response = service.handle(Request::AllocateObjects { count: 10 }).await;
        assert_eq!(response, Response::Success(Reply::Long(1)));
    }
}
