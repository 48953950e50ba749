mod error;

pub use error::ConnectionError;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::StoreError;
use crate::protocol::{ProtocolError, Response, ServerCodec};
use crate::server::service::StoreService;
use crate::store::LocalStore;

/// A single client connection.
///
/// Reads one request at a time, runs it against the service and writes the
/// response before reading the next. Store failures travel back as failure
/// responses and leave the connection open. A request that cannot be decoded
/// gets an `Io` failure and then the connection is closed, since the stream
/// position is no longer trustworthy.
pub struct Connection<T, S> {
    framed: Framed<T, ServerCodec>,
    conn_id: u64,
    service: Arc<StoreService<S>>,
}

impl<T, S> Connection<T, S>
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: LocalStore,
{
    pub fn new(stream: T, conn_id: u64, service: Arc<StoreService<S>>) -> Self {
        Self {
            framed: Framed::new(stream, ServerCodec::new()),
            conn_id,
            service,
        }
    }

    pub async fn run(&mut self, cancel_token: CancellationToken) -> Result<(), ConnectionError> {
        loop {
            tokio::select! {
                res = self.handle_message() => {
                    if res? {
                        return Ok(());
                    }
                }
                _ = cancel_token.cancelled() => {
                    debug!(conn_id = self.conn_id, "connection cancelled");
                    return Ok(());
                }
            }
        }
    }

    /// Handle a single request from the client.
    /// Returns true if the connection should terminate.
    async fn handle_message(&mut self) -> Result<bool, ConnectionError> {
        let request = match self.framed.next().await {
            Some(Ok(request)) => request,
            Some(Err(ProtocolError::Io(e))) => return Err(e.into()),
            Some(Err(e)) => {
                let message = match &e {
                    ProtocolError::UnknownOpcode(opcode) => format!("unknown opcode {}", opcode),
                    other => other.to_string(),
                };
                warn!(conn_id = self.conn_id, error = %e, "rejecting malformed request");
                self.framed
                    .send(Response::Failure(StoreError::Io(message)))
                    .await?;
                return Err(e.into());
            }
            None => return Ok(true), // EOF - client disconnected
        };

        let opcode = request.opcode();
        debug!(conn_id = self.conn_id, %opcode, tid = ?request.tid(), "request");

        let response = match AssertUnwindSafe(self.service.handle(request))
            .catch_unwind()
            .await
        {
            Ok(response) => response,
            Err(_) => {
                error!(conn_id = self.conn_id, %opcode, "request handler panicked");
                Response::Failure(StoreError::Internal(format!("{} failed unexpectedly", opcode)))
            }
        };
        if let Response::Failure(e) = &response {
            debug!(conn_id = self.conn_id, %opcode, kind = e.kind_name(), "request failed");
        }

        self.framed.send(response).await?;
        Ok(false)
    }
}
