//! In-memory store implementation.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use parking_lot::Mutex;

use crate::error::StoreError;
use crate::store::{LocalStore, Txn};
use crate::types::{ClassId, ObjectId, Tid};

/// In-memory store implementation.
///
/// Committed state lives in plain maps. Each live transaction keeps its own
/// pending writes, and every object or name it writes is owned by it until it
/// finishes. A second transaction touching an owned object or name fails with
/// `TransactionConflict`.
///
/// # Concurrency
///
/// One `parking_lot::Mutex` guards everything. Operations are map lookups and
/// memory copies; no I/O happens under the lock.
///
/// Class-info interning is not transactional: an interned ID stays valid even
/// if the transaction that interned it aborts.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<ObjectId, Vec<u8>>,
    bindings: BTreeMap<String, ObjectId>,
    class_infos: Vec<Vec<u8>>,
    class_ids: HashMap<Vec<u8>, ClassId>,
    next_oid: u64,
    next_tid: u64,
    txns: HashMap<Tid, PendingTxn>,
    object_owners: HashMap<ObjectId, Tid>,
    name_owners: HashMap<String, Tid>,
}

/// Writes of one live transaction. `None` values are removals.
#[derive(Default)]
struct PendingTxn {
    objects: HashMap<ObjectId, Option<Vec<u8>>>,
    bindings: BTreeMap<String, Option<ObjectId>>,
    prepared: bool,
}

impl PendingTxn {
    fn is_read_only(&self) -> bool {
        self.objects.is_empty() && self.bindings.is_empty()
    }
}

impl MemoryStore {
    /// Creates a new empty memory store.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_oid: 1,
                next_tid: 1,
                ..Inner::default()
            }),
        }
    }

    /// Number of transactions the store currently holds pending state for.
    pub fn live_transactions(&self) -> usize {
        self.inner.lock().txns.len()
    }

    /// Committed payload of `oid`, ignoring any pending writes.
    pub fn committed_object(&self, oid: ObjectId) -> Option<Vec<u8>> {
        self.inner.lock().objects.get(&oid).cloned()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    /// Pending state of an active (unprepared) transaction, created on first
    /// use. Fails once the transaction outlived its timeout.
    fn active(&mut self, txn: &Txn) -> Result<&mut PendingTxn, StoreError> {
        txn.check_timeout()?;
        let tid = txn.tid();
        let pending = self.txns.entry(tid).or_default();
        if pending.prepared {
            return Err(StoreError::IllegalState(format!(
                "transaction {} is already prepared",
                tid
            )));
        }
        Ok(pending)
    }

    fn visible_object(&self, tid: Tid, oid: ObjectId) -> Option<&Vec<u8>> {
        match self.txns.get(&tid).and_then(|t| t.objects.get(&oid)) {
            Some(pending) => pending.as_ref(),
            None => self.objects.get(&oid),
        }
    }

    fn visible_binding(&self, tid: Tid, name: &str) -> Option<ObjectId> {
        match self.txns.get(&tid).and_then(|t| t.bindings.get(name)) {
            Some(pending) => *pending,
            None => self.bindings.get(name).copied(),
        }
    }

    fn lock_object(&mut self, tid: Tid, oid: ObjectId) -> Result<(), StoreError> {
        match self.object_owners.entry(oid) {
            Entry::Occupied(owner) if *owner.get() != tid => {
                Err(StoreError::TransactionConflict(format!(
                    "transaction {} conflicts with transaction {} on object {}",
                    tid,
                    owner.get(),
                    oid
                )))
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(tid);
                Ok(())
            }
        }
    }

    fn lock_name(&mut self, tid: Tid, name: &str) -> Result<(), StoreError> {
        match self.name_owners.get(name) {
            Some(owner) if *owner != tid => Err(StoreError::TransactionConflict(format!(
                "transaction {} conflicts with transaction {} on name {:?}",
                tid, owner, name
            ))),
            Some(_) => Ok(()),
            None => {
                self.name_owners.insert(name.to_string(), tid);
                Ok(())
            }
        }
    }

    fn set_object(&mut self, txn: &Txn, oid: ObjectId, data: Vec<u8>) -> Result<(), StoreError> {
        self.active(txn)?;
        self.lock_object(txn.tid(), oid)?;
        self.active(txn)?.objects.insert(oid, Some(data));
        Ok(())
    }

    /// Drops the transaction and releases everything it owns.
    fn forget(&mut self, tid: Tid) -> Option<PendingTxn> {
        let txn = self.txns.remove(&tid)?;
        self.object_owners.retain(|_, owner| *owner != tid);
        self.name_owners.retain(|_, owner| *owner != tid);
        Some(txn)
    }

    fn apply(&mut self, txn: PendingTxn) {
        for (oid, data) in txn.objects {
            match data {
                Some(data) => {
                    self.objects.insert(oid, data);
                }
                None => {
                    self.objects.remove(&oid);
                }
            }
        }
        for (name, oid) in txn.bindings {
            match oid {
                Some(oid) => {
                    self.bindings.insert(name, oid);
                }
                None => {
                    self.bindings.remove(&name);
                }
            }
        }
    }
}

impl LocalStore for MemoryStore {
    async fn allocate_objects(&self, count: u32) -> Result<ObjectId, StoreError> {
        if count == 0 {
            return Err(StoreError::IllegalArgument(
                "object allocation count must be positive".to_string(),
            ));
        }
        let mut inner = self.inner.lock();
        let first = inner.next_oid;
        inner.next_oid += u64::from(count);
        Ok(ObjectId::new(first))
    }

    async fn allocate_tids(&self, count: u64) -> Result<Tid, StoreError> {
        if count == 0 {
            return Err(StoreError::IllegalArgument(
                "transaction ID block size must be positive".to_string(),
            ));
        }
        let mut inner = self.inner.lock();
        let first = inner.next_tid;
        inner.next_tid += count;
        Ok(Tid::new(first))
    }

    async fn mark_for_update(&self, txn: &Txn, oid: ObjectId) -> Result<(), StoreError> {
        let tid = txn.tid();
        let mut inner = self.inner.lock();
        inner.active(txn)?;
        if inner.visible_object(tid, oid).is_none() {
            return Err(StoreError::object_not_found(oid));
        }
        inner.lock_object(tid, oid)
    }

    async fn get_object(
        &self,
        txn: &Txn,
        oid: ObjectId,
        for_update: bool,
    ) -> Result<Vec<u8>, StoreError> {
        let tid = txn.tid();
        let mut inner = self.inner.lock();
        inner.active(txn)?;
        let Some(data) = inner.visible_object(tid, oid).cloned() else {
            return Err(StoreError::object_not_found(oid));
        };
        if for_update {
            inner.lock_object(tid, oid)?;
        }
        Ok(data)
    }

    async fn set_object(&self, txn: &Txn, oid: ObjectId, data: Vec<u8>) -> Result<(), StoreError> {
        self.inner.lock().set_object(txn, oid, data)
    }

    async fn set_objects(
        &self,
        txn: &Txn,
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
        let mut inner = self.inner.lock();
        for (oid, data) in oids.into_iter().zip(data) {
            inner.set_object(txn, oid, data)?;
        }
        Ok(())
    }

    async fn remove_object(&self, txn: &Txn, oid: ObjectId) -> Result<(), StoreError> {
        let tid = txn.tid();
        let mut inner = self.inner.lock();
        inner.active(txn)?;
        if inner.visible_object(tid, oid).is_none() {
            return Err(StoreError::object_not_found(oid));
        }
        inner.lock_object(tid, oid)?;
        inner.active(txn)?.objects.insert(oid, None);
        Ok(())
    }

    async fn get_binding(&self, txn: &Txn, name: &str) -> Result<ObjectId, StoreError> {
        let tid = txn.tid();
        let mut inner = self.inner.lock();
        inner.active(txn)?;
        inner
            .visible_binding(tid, name)
            .ok_or_else(|| StoreError::name_not_bound(name))
    }

    async fn set_binding(&self, txn: &Txn, name: &str, oid: ObjectId) -> Result<(), StoreError> {
        let tid = txn.tid();
        let mut inner = self.inner.lock();
        inner.active(txn)?;
        inner.lock_name(tid, name)?;
        inner
            .active(txn)?
            .bindings
            .insert(name.to_string(), Some(oid));
        Ok(())
    }

    async fn remove_binding(&self, txn: &Txn, name: &str) -> Result<(), StoreError> {
        let tid = txn.tid();
        let mut inner = self.inner.lock();
        inner.active(txn)?;
        if inner.visible_binding(tid, name).is_none() {
            return Err(StoreError::name_not_bound(name));
        }
        inner.lock_name(tid, name)?;
        inner.active(txn)?.bindings.insert(name.to_string(), None);
        Ok(())
    }

    async fn next_bound_name(
        &self,
        txn: &Txn,
        name: Option<&str>,
    ) -> Result<Option<String>, StoreError> {
        let tid = txn.tid();
        let mut guard = self.inner.lock();
        guard.active(txn)?;
        let inner = &*guard;
        let no_writes = BTreeMap::new();
        let pending = inner.txns.get(&tid).map_or(&no_writes, |t| &t.bindings);
        let lower = match name {
            Some(name) => Bound::Excluded(name),
            None => Bound::Unbounded,
        };

        let next_pending = pending
            .range::<str, _>((lower, Bound::Unbounded))
            .find(|(_, oid)| oid.is_some())
            .map(|(name, _)| name.clone());
        let next_committed = inner
            .bindings
            .range::<str, _>((lower, Bound::Unbounded))
            .map(|(name, _)| name)
            .find(|name| !matches!(pending.get(name.as_str()), Some(None)))
            .cloned();

        Ok(match (next_pending, next_committed) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }

    async fn get_class_id(&self, txn: &Txn, class_info: &[u8]) -> Result<ClassId, StoreError> {
        let mut inner = self.inner.lock();
        inner.active(txn)?;
        if let Some(id) = inner.class_ids.get(class_info) {
            return Ok(*id);
        }
        inner.class_infos.push(class_info.to_vec());
        let id = ClassId::new(inner.class_infos.len() as u32);
        inner.class_ids.insert(class_info.to_vec(), id);
        Ok(id)
    }

    async fn get_class_info(&self, txn: &Txn, class_id: ClassId) -> Result<Vec<u8>, StoreError> {
        let mut inner = self.inner.lock();
        inner.active(txn)?;
        let index = (class_id.as_u32() as usize).wrapping_sub(1);
        inner.class_infos.get(index).cloned().ok_or_else(|| {
            StoreError::ObjectNotFound(format!("no class info for class ID {}", class_id))
        })
    }

    async fn prepare(&self, txn: &Txn) -> Result<bool, StoreError> {
        let tid = txn.tid();
        let mut inner = self.inner.lock();
        let pending = inner.active(txn)?;
        if pending.is_read_only() {
            inner.forget(tid);
            return Ok(true);
        }
        pending.prepared = true;
        Ok(false)
    }

    async fn commit(&self, txn: &Txn) -> Result<(), StoreError> {
        let tid = txn.tid();
        let mut inner = self.inner.lock();
        match inner.txns.get(&tid) {
            Some(pending) if pending.prepared => {}
            _ => {
                return Err(StoreError::IllegalState(format!(
                    "transaction {} is not prepared",
                    tid
                )));
            }
        }
        if let Some(pending) = inner.forget(tid) {
            inner.apply(pending);
        }
        Ok(())
    }

    async fn prepare_and_commit(&self, txn: &Txn) -> Result<(), StoreError> {
        let tid = txn.tid();
        let mut inner = self.inner.lock();
        inner.active(txn)?;
        if let Some(pending) = inner.forget(tid) {
            inner.apply(pending);
        }
        Ok(())
    }

    async fn abort(&self, txn: &Txn) -> Result<(), StoreError> {
        self.inner.lock().forget(txn.tid());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn txn(id: u64) -> Txn {
        Txn::new(Tid::new(id), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_allocate_objects_hands_out_disjoint_blocks() {
        let store = MemoryStore::new();
        let first = store.allocate_objects(100).await.unwrap();
        let second = store.allocate_objects(100).await.unwrap();
        assert_eq!(second.as_u64(), first.as_u64() + 100);
    }

    #[tokio::test]
    async fn test_allocate_zero_objects_is_rejected() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.allocate_objects(0).await,
            Err(StoreError::IllegalArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_get_missing_object() {
        let store = MemoryStore::new();
        let result = store.get_object(&txn(1), ObjectId::new(42), false).await;
        assert_eq!(
            result,
            Err(StoreError::ObjectNotFound("no object 42".to_string()))
        );
    }

    #[tokio::test]
    async fn test_writes_visible_only_after_commit() {
        let store = MemoryStore::new();
        let writer = txn(1);
        let reader = txn(2);
        let oid = ObjectId::new(5);

        store.set_object(&writer, oid, b"v1".to_vec()).await.unwrap();
        assert_eq!(store.get_object(&writer, oid, false).await.unwrap(), b"v1");
        assert!(store.get_object(&reader, oid, false).await.is_err());

        assert!(!store.prepare(&writer).await.unwrap());
        store.commit(&writer).await.unwrap();

        assert_eq!(store.get_object(&reader, oid, false).await.unwrap(), b"v1");
        assert_eq!(store.committed_object(oid), Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn test_abort_discards_writes() {
        let store = MemoryStore::new();
        let t = txn(1);
        store.set_object(&t, ObjectId::new(1), vec![1]).await.unwrap();
        store.set_binding(&t, "a", ObjectId::new(1)).await.unwrap();
        store.abort(&t).await.unwrap();

        assert_eq!(store.committed_object(ObjectId::new(1)), None);
        assert_eq!(store.live_transactions(), 0);
    }

    #[tokio::test]
    async fn test_read_only_prepare_forgets_transaction() {
        let store = MemoryStore::new();
        let t = txn(1);
        let _ = store.get_binding(&t, "missing").await;
        assert!(store.prepare(&t).await.unwrap());
        assert_eq!(store.live_transactions(), 0);
    }

    #[tokio::test]
    async fn test_expired_transaction_times_out() {
        let store = MemoryStore::new();
        let t = Txn::new(Tid::new(1), Duration::from_millis(20));
        store.set_object(&t, ObjectId::new(1), vec![1]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(matches!(
            store.get_object(&t, ObjectId::new(1), false).await,
            Err(StoreError::TransactionTimeout(_))
        ));
        assert!(matches!(
            store.prepare(&t).await,
            Err(StoreError::TransactionTimeout(_))
        ));

        // Finishing the transaction still releases its writes.
        store.abort(&t).await.unwrap();
        store.set_object(&txn(2), ObjectId::new(1), vec![2]).await.unwrap();
    }

    #[tokio::test]
    async fn test_conflicting_writers() {
        let store = MemoryStore::new();
        let oid = ObjectId::new(9);
        store.set_object(&txn(1), oid, vec![1]).await.unwrap();

        let result = store.set_object(&txn(2), oid, vec![2]).await;
        assert!(matches!(result, Err(StoreError::TransactionConflict(_))));

        store.abort(&txn(1)).await.unwrap();
        store.set_object(&txn(2), oid, vec![2]).await.unwrap();
    }

    #[tokio::test]
    async fn test_operations_after_prepare_are_rejected() {
        let store = MemoryStore::new();
        let t = txn(1);
        store.set_object(&t, ObjectId::new(1), vec![1]).await.unwrap();
        store.prepare(&t).await.unwrap();

        let result = store.set_object(&t, ObjectId::new(2), vec![2]).await;
        assert!(matches!(result, Err(StoreError::IllegalState(_))));
        assert!(matches!(
            store.prepare_and_commit(&t).await,
            Err(StoreError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn test_commit_requires_prepare() {
        let store = MemoryStore::new();
        let t = txn(1);
        store.set_object(&t, ObjectId::new(1), vec![1]).await.unwrap();
        assert!(matches!(
            store.commit(&t).await,
            Err(StoreError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn test_bindings_and_next_bound_name() {
        let store = MemoryStore::new();
        let setup = txn(1);
        store.set_binding(&setup, "b", ObjectId::new(2)).await.unwrap();
        store.set_binding(&setup, "d", ObjectId::new(4)).await.unwrap();
        store.prepare_and_commit(&setup).await.unwrap();

        let t = txn(2);
        store.set_binding(&t, "c", ObjectId::new(3)).await.unwrap();
        store.remove_binding(&t, "d").await.unwrap();

        assert_eq!(store.next_bound_name(&t, None).await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.next_bound_name(&t, Some("b")).await.unwrap().as_deref(), Some("c"));
        assert_eq!(store.next_bound_name(&t, Some("c")).await.unwrap(), None);
        assert_eq!(store.get_binding(&t, "c").await.unwrap(), ObjectId::new(3));
        assert!(matches!(
            store.get_binding(&t, "d").await,
            Err(StoreError::NameNotBound(_))
        ));

        let other = txn(3);
        assert_eq!(store.get_binding(&other, "d").await.unwrap(), ObjectId::new(4));
    }

    #[tokio::test]
    async fn test_class_ids_are_interned() {
        let store = MemoryStore::new();
        let t = txn(1);
        let a = store.get_class_id(&t, b"class-a").await.unwrap();
        let b = store.get_class_id(&t, b"class-b").await.unwrap();
        let again = store.get_class_id(&t, b"class-a").await.unwrap();

        assert_eq!(a, ClassId::new(1));
        assert_eq!(b, ClassId::new(2));
        assert_eq!(a, again);
        assert_eq!(store.get_class_info(&t, b).await.unwrap(), b"class-b");
        assert!(store.get_class_info(&t, ClassId::new(0)).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_object() {
        let store = MemoryStore::new();
        let setup = txn(1);
        store.set_object(&setup, ObjectId::new(1), vec![7]).await.unwrap();
        store.prepare_and_commit(&setup).await.unwrap();

        let t = txn(2);
        store.remove_object(&t, ObjectId::new(1)).await.unwrap();
        assert!(store.get_object(&t, ObjectId::new(1), false).await.is_err());
        assert!(store.remove_object(&t, ObjectId::new(1)).await.is_err());
        store.prepare_and_commit(&t).await.unwrap();
        assert_eq!(store.committed_object(ObjectId::new(1)), None);
    }
}
