//! The byte-oriented object/binding repository behind the server.
//!
//! The server never interprets object payloads. It forwards every call to a
//! [`LocalStore`] together with the server-side [`Txn`] the call runs under,
//! and the store owns write sets, locking and conflict detection.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! | StoreService     |  <- resolves tids through the registry
//! +------------------+
//!          |
//!          v
//! +------------------+
//! | LocalStore trait |
//! +------------------+
//!          |
//!          v
//! +--------------+
//! | MemoryStore  |
//! +--------------+
//! ```

pub mod memory;

use std::time::{Duration, Instant};

use crate::error::StoreError;
use crate::types::{ClassId, ObjectId, Tid};

pub use memory::MemoryStore;

/// A server-side transaction.
///
/// Created by `createTransaction` and destroyed when an outcome operation (or
/// the reaper) removes it from the registry.
#[derive(Debug, Clone)]
pub struct Txn {
    tid: Tid,
    created: Instant,
    timeout: Duration,
}

impl Txn {
    pub fn new(tid: Tid, timeout: Duration) -> Self {
        Self {
            tid,
            created: Instant::now(),
            timeout,
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// Timeout requested by the client when the transaction was created,
    /// capped at the server's transaction timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the transaction was created before `now - timeout`.
    pub fn is_older_than(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.created) > timeout
    }

    /// Fails with `TransactionTimeout` once the transaction outlived its own
    /// timeout.
    pub fn check_timeout(&self) -> Result<(), StoreError> {
        let elapsed = self.created.elapsed();
        if elapsed > self.timeout {
            return Err(StoreError::TransactionTimeout(format!(
                "transaction {} timed out after {:?} (timeout {:?})",
                self.tid, elapsed, self.timeout
            )));
        }
        Ok(())
    }
}

/// Store backend trait.
///
/// Operations that do work under a transaction call [`Txn::check_timeout`]
/// first. `commit` and `abort` do not, so a prepared transaction can always
/// be finished.
///
/// Implementations must be thread-safe (Sync + Send): the server calls into
/// the store from many connection tasks and from the reaper concurrently.
///
/// Failures use the [`StoreError`] taxonomy unchanged; the server forwards
/// them to clients as they are.
pub trait LocalStore: Send + Sync {
    /// Reserves `count` consecutive object IDs and returns the first one.
    ///
    /// Runs outside any client transaction and takes effect immediately.
    fn allocate_objects(
        &self,
        count: u32,
    ) -> impl std::future::Future<Output = Result<ObjectId, StoreError>> + Send;

    /// Reserves `count` consecutive transaction IDs and returns the first one.
    fn allocate_tids(
        &self,
        count: u64,
    ) -> impl std::future::Future<Output = Result<Tid, StoreError>> + Send;

    /// Locks the object for update without reading it.
    fn mark_for_update(
        &self,
        txn: &Txn,
        oid: ObjectId,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn get_object(
        &self,
        txn: &Txn,
        oid: ObjectId,
        for_update: bool,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, StoreError>> + Send;

    fn set_object(
        &self,
        txn: &Txn,
        oid: ObjectId,
        data: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Writes several objects at once. `oids` and `data` have equal length.
    fn set_objects(
        &self,
        txn: &Txn,
        oids: Vec<ObjectId>,
        data: Vec<Vec<u8>>,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn remove_object(
        &self,
        txn: &Txn,
        oid: ObjectId,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn get_binding(
        &self,
        txn: &Txn,
        name: &str,
    ) -> impl std::future::Future<Output = Result<ObjectId, StoreError>> + Send;

    fn set_binding(
        &self,
        txn: &Txn,
        name: &str,
        oid: ObjectId,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    fn remove_binding(
        &self,
        txn: &Txn,
        name: &str,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Returns the first bound name after `name` in name order, or the first
    /// bound name overall if `name` is `None`.
    fn next_bound_name(
        &self,
        txn: &Txn,
        name: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Option<String>, StoreError>> + Send;

    /// Interns class-info bytes, returning the same ID for equal bytes.
    fn get_class_id(
        &self,
        txn: &Txn,
        class_info: &[u8],
    ) -> impl std::future::Future<Output = Result<ClassId, StoreError>> + Send;

    fn get_class_info(
        &self,
        txn: &Txn,
        class_id: ClassId,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, StoreError>> + Send;

    /// Votes on the transaction. `Ok(true)` means read-only: the store has
    /// already forgotten the transaction and expects no commit or abort.
    fn prepare(
        &self,
        txn: &Txn,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;

    /// Commits a prepared transaction.
    fn commit(&self, txn: &Txn)
    -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Prepares and commits in one step.
    fn prepare_and_commit(
        &self,
        txn: &Txn,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Discards the transaction's pending work. Aborting a transaction the
    /// store never saw is not an error.
    fn abort(&self, txn: &Txn) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}
