use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use crate::client::context::TxnContext;
use crate::client::error::ClientError;
use crate::client::pool::{Dialer, HandlePool, TcpDialer};
use crate::config::{ClientConfig, ConfigError};
use crate::error::StoreError;
use crate::protocol::codec::{DEFAULT_MAX_PAYLOAD_SIZE, MAX_ARRAY_LEN};
use crate::protocol::{ProtocolError, Reply, Request};
use crate::txn::{Participant, Transaction};
use crate::types::{ClassId, IdWindow, ObjectId, Tid};

/// Name the client registers under when it joins a local transaction.
pub const PARTICIPANT_NAME: &str = "netstore";

/// Transactional proxy for a remote store.
///
/// Every operation takes the caller's [`TxnContext`] and local transaction.
/// The first operation under a transaction joins it and creates the matching
/// server transaction; later operations reuse the tid bound in the context.
///
/// Failures that end the transaction (transport errors, timeouts, conflicts,
/// an unknown tid) abort the local transaction with the returned error as the
/// cause before they are returned. Other store failures leave it usable.
pub struct StoreClient<D: Dialer = TcpDialer> {
    config: ClientConfig,
    pool: HandlePool<D>,
    /// Object IDs reserved from the server but not yet handed out.
    oids: Mutex<IdWindow>,
    /// Serializes refills of `oids`; never held while `oids` is locked.
    oid_refill: tokio::sync::Mutex<()>,
    lifecycle: Lifecycle,
}

impl StoreClient<TcpDialer> {
    /// Creates a client for the configured server. Connections are opened on
    /// first use.
    pub fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let dialer = TcpDialer::new(config.server_addr());
        Self::with_dialer(config, dialer)
    }
}

impl<D: Dialer> StoreClient<D> {
    pub fn with_dialer(config: ClientConfig, dialer: D) -> Result<Self, ClientError> {
        config.validate()?;
        Ok(Self {
            config,
            pool: HandlePool::new(dialer),
            oids: Mutex::new(IdWindow::empty()),
            oid_refill: tokio::sync::Mutex::new(()),
            lifecycle: Lifecycle::new(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Number of joined transactions that have not reached an outcome.
    pub fn live_transactions(&self) -> usize {
        self.lifecycle.live()
    }

    pub fn is_shut_down(&self) -> bool {
        self.lifecycle.ensure_running().is_err()
    }

    /// Stops accepting new transactions, waits for the live ones to finish and
    /// closes the pooled connections. Every call made afterwards fails with
    /// [`ClientError::ShutDown`].
    ///
    /// Dropping the returned future stops the wait but keeps refusing new
    /// transactions.
    pub async fn shutdown(&self) {
        info!(live = self.lifecycle.live(), "store client shutting down");
        self.lifecycle.drain().await;
        self.pool.clear();
        info!("store client shut down");
    }

    /// Returns a fresh object ID.
    ///
    /// IDs come from a block reserved on the server; a round trip happens
    /// only when the block is used up.
    pub async fn create_object(
        &self,
        ctx: &TxnContext,
        txn: &Arc<dyn Transaction>,
    ) -> Result<ObjectId, ClientError> {
        self.join(ctx, txn).await?;

        if let Some(oid) = self.take_oid() {
            return Ok(oid);
        }
        let _refill = self.oid_refill.lock().await;
        if let Some(oid) = self.take_oid() {
            return Ok(oid);
        }

        let block = self.config.allocation_block_size;
        let count = i32::try_from(block)
            .map_err(|_| ConfigError::InvalidAllocationBlockSize { value: block })?;
        let first = self
            .exchange(Request::AllocateObjects { count }, Reply::into_long)
            .await
            .map_err(|e| self.fail(ctx, txn, e))?;
        debug!(first, count, "reserved object IDs");

        let mut oids = self.oids.lock();
        oids.refill(first, u64::from(block));
        oids.take()
            .map(ObjectId::new)
            .ok_or_else(|| ClientError::IllegalState("empty object ID block".to_string()))
    }

    pub async fn mark_for_update(
        &self,
        ctx: &TxnContext,
        txn: &Arc<dyn Transaction>,
        oid: ObjectId,
    ) -> Result<(), ClientError> {
        self.invoke(
            ctx,
            txn,
            |tid| Request::MarkForUpdate { tid, oid },
            Reply::into_unit,
        )
        .await
    }

    pub async fn get_object(
        &self,
        ctx: &TxnContext,
        txn: &Arc<dyn Transaction>,
        oid: ObjectId,
        for_update: bool,
    ) -> Result<Vec<u8>, ClientError> {
        self.invoke(
            ctx,
            txn,
            |tid| Request::GetObject {
                tid,
                oid,
                for_update,
            },
            Reply::into_bytes,
        )
        .await
    }

    pub async fn set_object(
        &self,
        ctx: &TxnContext,
        txn: &Arc<dyn Transaction>,
        oid: ObjectId,
        data: Vec<u8>,
    ) -> Result<(), ClientError> {
        check_payloads([data.as_slice()])?;
        self.invoke(
            ctx,
            txn,
            move |tid| Request::SetObject { tid, oid, data },
            Reply::into_unit,
        )
        .await
    }

    /// Writes several objects in one round trip.
    pub async fn set_objects(
        &self,
        ctx: &TxnContext,
        txn: &Arc<dyn Transaction>,
        oids: Vec<ObjectId>,
        data: Vec<Vec<u8>>,
    ) -> Result<(), ClientError> {
        if oids.len() != data.len() {
            return Err(ClientError::IllegalArgument(format!(
                "{} object IDs but {} payloads",
                oids.len(),
                data.len()
            )));
        }
        if oids.len() > MAX_ARRAY_LEN {
            return Err(ClientError::IllegalArgument(format!(
                "{} objects exceed the limit of {} per call",
                oids.len(),
                MAX_ARRAY_LEN
            )));
        }
        check_payloads(data.iter().map(Vec::as_slice))?;
        self.invoke(
            ctx,
            txn,
            move |tid| Request::SetObjects { tid, oids, data },
            Reply::into_unit,
        )
        .await
    }

    pub async fn remove_object(
        &self,
        ctx: &TxnContext,
        txn: &Arc<dyn Transaction>,
        oid: ObjectId,
    ) -> Result<(), ClientError> {
        self.invoke(
            ctx,
            txn,
            |tid| Request::RemoveObject { tid, oid },
            Reply::into_unit,
        )
        .await
    }

    pub async fn get_binding(
        &self,
        ctx: &TxnContext,
        txn: &Arc<dyn Transaction>,
        name: &str,
    ) -> Result<ObjectId, ClientError> {
        check_payloads([name.as_bytes()])?;
        let oid = self
            .invoke(
                ctx,
                txn,
                |tid| Request::GetBinding {
                    tid,
                    name: name.to_string(),
                },
                Reply::into_long,
            )
            .await?;
        Ok(ObjectId::new(oid))
    }

    pub async fn set_binding(
        &self,
        ctx: &TxnContext,
        txn: &Arc<dyn Transaction>,
        name: &str,
        oid: ObjectId,
    ) -> Result<(), ClientError> {
        check_payloads([name.as_bytes()])?;
        self.invoke(
            ctx,
            txn,
            |tid| Request::SetBinding {
                tid,
                name: name.to_string(),
                oid,
            },
            Reply::into_unit,
        )
        .await
    }

    pub async fn remove_binding(
        &self,
        ctx: &TxnContext,
        txn: &Arc<dyn Transaction>,
        name: &str,
    ) -> Result<(), ClientError> {
        check_payloads([name.as_bytes()])?;
        self.invoke(
            ctx,
            txn,
            |tid| Request::RemoveBinding {
                tid,
                name: name.to_string(),
            },
            Reply::into_unit,
        )
        .await
    }

    /// Returns the bound name following `name`, or the first one if `name`
    /// is `None`.
    pub async fn next_bound_name(
        &self,
        ctx: &TxnContext,
        txn: &Arc<dyn Transaction>,
        name: Option<&str>,
    ) -> Result<Option<String>, ClientError> {
        check_payloads(name.map(str::as_bytes))?;
        self.invoke(
            ctx,
            txn,
            |tid| Request::NextBoundName {
                tid,
                name: name.map(str::to_string),
            },
            Reply::into_name,
        )
        .await
    }

    pub async fn get_class_id(
        &self,
        ctx: &TxnContext,
        txn: &Arc<dyn Transaction>,
        class_info: &[u8],
    ) -> Result<ClassId, ClientError> {
        check_payloads([class_info])?;
        let id = self
            .invoke(
                ctx,
                txn,
                |tid| Request::GetClassId {
                    tid,
                    class_info: class_info.to_vec(),
                },
                Reply::into_int,
            )
            .await?;
        Ok(ClassId::new(id))
    }

    pub async fn get_class_info(
        &self,
        ctx: &TxnContext,
        txn: &Arc<dyn Transaction>,
        class_id: ClassId,
    ) -> Result<Vec<u8>, ClientError> {
        self.invoke(
            ctx,
            txn,
            |tid| Request::GetClassInfo { tid, class_id },
            Reply::into_bytes,
        )
        .await
    }

    /// Joins `txn` if needed, then performs one call under its tid.
    async fn invoke<T>(
        &self,
        ctx: &TxnContext,
        txn: &Arc<dyn Transaction>,
        request: impl FnOnce(Tid) -> Request,
        reply: impl FnOnce(Reply) -> Result<T, ProtocolError>,
    ) -> Result<T, ClientError> {
        let tid = self.join(ctx, txn).await?;
        self.exchange(request(tid), reply)
            .await
            .map_err(|e| self.fail(ctx, txn, e))
    }

    /// Returns the tid bound to `txn`, creating the server transaction on
    /// first use.
    async fn join(&self, ctx: &TxnContext, txn: &Arc<dyn Transaction>) -> Result<Tid, ClientError> {
        self.lifecycle.ensure_running()?;
        let bound = ctx.bound_tid(txn.as_ref())?;
        self.check_timeout(txn.as_ref())?;
        if let Some(tid) = bound {
            return Ok(tid);
        }

        let _joining = ctx.lock_join().await;
        if let Some(tid) = ctx.bound_tid(txn.as_ref())? {
            return Ok(tid);
        }
        let slot = self.lifecycle.begin()?;
        txn.join(PARTICIPANT_NAME)?;
        let timeout_ms =
            i64::try_from(self.effective_timeout(txn.as_ref()).as_millis()).unwrap_or(i64::MAX);
        let tid = self
            .exchange(Request::CreateTransaction { timeout_ms }, Reply::into_long)
            .await
            .map_err(|e| self.fail(ctx, txn, e))?;
        let tid = Tid::new(tid);

        ctx.bind(txn.clone(), tid);
        slot.keep();
        debug!(txn = txn.id(), %tid, "joined transaction");
        Ok(tid)
    }

    /// One request/response exchange, with server failures surfaced as
    /// [`ClientError::Store`] and transport failures as
    /// [`ClientError::Network`].
    async fn exchange<T>(
        &self,
        request: Request,
        reply: impl FnOnce(Reply) -> Result<T, ProtocolError>,
    ) -> Result<T, ClientError> {
        trace!(opcode = %request.opcode(), tid = ?request.tid(), "store call");
        let response = self.pool.call(request).await?;
        let result = response.into_result()?;
        Ok(reply(result)?)
    }

    /// Classifies a failed call and aborts the local transaction if the
    /// failure ends it.
    fn fail(&self, ctx: &TxnContext, txn: &Arc<dyn Transaction>, error: ClientError) -> ClientError {
        let error = match error {
            ClientError::Store(StoreError::TransactionNotActive(message)) => {
                let elapsed = txn.creation_time().elapsed();
                let timeout = self.effective_timeout(txn.as_ref());
                if elapsed > timeout {
                    ClientError::Timeout {
                        txn_id: txn.id(),
                        elapsed,
                        timeout,
                    }
                } else {
                    ClientError::Store(StoreError::TransactionNotActive(message))
                }
            }
            other => other,
        };

        if error.aborts_transaction() {
            // Everything but a transport failure means the server has
            // already dropped the transaction.
            if !matches!(error, ClientError::Network(_)) {
                ctx.mark_server_aborted(txn.as_ref());
            }
            warn!(txn = txn.id(), error = %error, "store call aborted transaction");
            txn.abort(error.clone());
        }
        error
    }

    fn effective_timeout(&self, txn: &dyn Transaction) -> Duration {
        txn.timeout().min(self.config.max_txn_timeout)
    }

    fn check_timeout(&self, txn: &dyn Transaction) -> Result<(), ClientError> {
        let elapsed = txn.creation_time().elapsed();
        let timeout = self.effective_timeout(txn);
        if elapsed > timeout {
            let error = ClientError::Timeout {
                txn_id: txn.id(),
                elapsed,
                timeout,
            };
            txn.abort(error.clone());
            return Err(error);
        }
        Ok(())
    }

    fn take_oid(&self) -> Option<ObjectId> {
        self.oids.lock().take().map(ObjectId::new)
    }

    /// Clears the binding for `txn` once it reached an outcome.
    fn finish(&self, ctx: &TxnContext, txn: &Arc<dyn Transaction>) -> Result<(), ClientError> {
        if ctx.take(txn.as_ref())?.is_some() {
            self.lifecycle.end();
        }
        Ok(())
    }
}

impl<D: Dialer> Participant for StoreClient<D> {
    async fn prepare(&self, ctx: &TxnContext, txn: &Arc<dyn Transaction>) -> Result<bool, ClientError> {
        self.lifecycle.ensure_running()?;
        self.check_timeout(txn.as_ref())?;
        // Marked before sending, so a failed prepare is never retried.
        let tid = ctx.with_joined(txn.as_ref(), |info| {
            if info.prepared {
                return Err(ClientError::IllegalState(format!(
                    "transaction {} is already prepared",
                    info.tid
                )));
            }
            info.prepared = true;
            Ok(info.tid)
        })?;

        let read_only = self
            .exchange(Request::Prepare { tid }, Reply::into_bool)
            .await
            .map_err(|e| self.fail(ctx, txn, e))?;
        if read_only {
            self.finish(ctx, txn)?;
        }
        debug!(txn = txn.id(), %tid, read_only, "prepared transaction");
        Ok(read_only)
    }

    async fn commit(&self, ctx: &TxnContext, txn: &Arc<dyn Transaction>) -> Result<(), ClientError> {
        self.lifecycle.ensure_running()?;
        self.check_timeout(txn.as_ref())?;
        let tid = ctx.with_joined(txn.as_ref(), |info| {
            if !info.prepared {
                return Err(ClientError::IllegalState(format!(
                    "transaction {} has not been prepared",
                    info.tid
                )));
            }
            Ok(info.tid)
        })?;

        self.exchange(Request::Commit { tid }, Reply::into_unit)
            .await
            .map_err(|e| self.fail(ctx, txn, e))?;
        self.finish(ctx, txn)?;
        debug!(txn = txn.id(), %tid, "committed transaction");
        Ok(())
    }

    async fn prepare_and_commit(
        &self,
        ctx: &TxnContext,
        txn: &Arc<dyn Transaction>,
    ) -> Result<(), ClientError> {
        self.lifecycle.ensure_running()?;
        self.check_timeout(txn.as_ref())?;
        let tid = ctx.with_joined(txn.as_ref(), |info| {
            if info.prepared {
                return Err(ClientError::IllegalState(format!(
                    "transaction {} is already prepared",
                    info.tid
                )));
            }
            info.prepared = true;
            Ok(info.tid)
        })?;

        self.exchange(Request::PrepareAndCommit { tid }, Reply::into_unit)
            .await
            .map_err(|e| self.fail(ctx, txn, e))?;
        self.finish(ctx, txn)?;
        debug!(txn = txn.id(), %tid, "committed transaction");
        Ok(())
    }

    /// Aborts the server transaction. Succeeds quietly if the server already
    /// dropped it or the transaction never joined.
    async fn abort(&self, ctx: &TxnContext, txn: &Arc<dyn Transaction>) -> Result<(), ClientError> {
        self.lifecycle.ensure_running()?;
        let Some(info) = ctx.take(txn.as_ref())? else {
            trace!(txn = txn.id(), "abort of transaction that never joined");
            return Ok(());
        };
        let _finished = self.lifecycle.adopt();

        if info.server_aborted {
            debug!(txn = txn.id(), tid = %info.tid, "transaction already aborted by server");
            return Ok(());
        }
        match self
            .exchange(Request::Abort { tid: info.tid }, Reply::into_unit)
            .await
        {
            Ok(()) | Err(ClientError::Store(StoreError::TransactionNotActive(_))) => {
                debug!(txn = txn.id(), tid = %info.tid, "aborted transaction");
                Ok(())
            }
            Err(e) => {
                warn!(txn = txn.id(), tid = %info.tid, error = %e, "failed to abort transaction");
                Err(e)
            }
        }
    }
}

/// Rejects payloads the server would refuse to decode, before any round trip.
fn check_payloads<'a>(payloads: impl IntoIterator<Item = &'a [u8]>) -> Result<(), ClientError> {
    match payloads
        .into_iter()
        .find(|payload| payload.len() > DEFAULT_MAX_PAYLOAD_SIZE)
    {
        Some(payload) => Err(ClientError::IllegalArgument(format!(
            "payload of {} bytes exceeds the limit of {} bytes",
            payload.len(),
            DEFAULT_MAX_PAYLOAD_SIZE
        ))),
        None => Ok(()),
    }
}

/// Live-transaction count and shutdown state.
struct Lifecycle {
    state: Mutex<LifecycleState>,
    drained: Notify,
}

#[derive(Default)]
struct LifecycleState {
    live_txns: usize,
    shutting_down: bool,
    shut_down: bool,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::default()),
            drained: Notify::new(),
        }
    }

    fn ensure_running(&self) -> Result<(), ClientError> {
        if self.state.lock().shut_down {
            Err(ClientError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn live(&self) -> usize {
        self.state.lock().live_txns
    }

    /// Counts a new transaction. Refused once shutdown has started.
    fn begin(&self) -> Result<TxnSlot<'_>, ClientError> {
        let mut state = self.state.lock();
        if state.shutting_down || state.shut_down {
            return Err(ClientError::ShutDown);
        }
        state.live_txns += 1;
        Ok(TxnSlot {
            lifecycle: self,
            armed: true,
        })
    }

    /// Takes responsibility for ending an already counted transaction.
    fn adopt(&self) -> TxnSlot<'_> {
        TxnSlot {
            lifecycle: self,
            armed: true,
        }
    }

    fn end(&self) {
        let mut state = self.state.lock();
        state.live_txns = state.live_txns.saturating_sub(1);
        if state.live_txns == 0 {
            self.drained.notify_waiters();
        }
    }

    async fn drain(&self) {
        self.state.lock().shutting_down = true;
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let idle = self.state.lock().live_txns == 0;
            if idle {
                break;
            }
            notified.await;
        }
        self.state.lock().shut_down = true;
    }
}

/// Ends a counted transaction when dropped, unless kept.
struct TxnSlot<'a> {
    lifecycle: &'a Lifecycle,
    armed: bool,
}

impl TxnSlot<'_> {
    /// Leaves the transaction counted; its outcome ends it later.
    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for TxnSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.lifecycle.end();
        }
    }
}
