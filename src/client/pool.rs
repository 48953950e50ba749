use std::future::Future;
use std::io;

use crossbeam_deque::{Injector, Steal};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use crate::protocol::{ClientCodec, ProtocolError, Request, Response};

/// Opens transport streams to the server.
pub trait Dialer: Send + Sync + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn dial(&self) -> impl Future<Output = io::Result<Self::Io>> + Send;
}

/// Connects to `host:port` over TCP.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Dialer for TcpDialer {
    type Io = TcpStream;

    async fn dial(&self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(self.addr.as_str()).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

type Handle<D> = Framed<<D as Dialer>::Io, ClientCodec>;

/// Pool of idle request streams.
///
/// Each call borrows one stream for exactly one request/response exchange.
/// A stream goes back to the pool only if that exchange completed; a stream
/// that failed or whose call was cancelled midway is dropped, and the next
/// call dials a fresh one.
pub struct HandlePool<D: Dialer> {
    dialer: D,
    idle: Injector<Handle<D>>,
}

impl<D: Dialer> HandlePool<D> {
    pub fn new(dialer: D) -> Self {
        Self {
            dialer,
            idle: Injector::new(),
        }
    }

    /// Borrows an idle stream, dialing a new one if none is available.
    pub async fn acquire(&self) -> Result<PooledHandle<'_, D>, ProtocolError> {
        let framed = match self.pop() {
            Some(framed) => framed,
            None => {
                trace!("dialing new store connection");
                Framed::new(self.dialer.dial().await?, ClientCodec::new())
            }
        };
        Ok(PooledHandle {
            pool: self,
            framed: Some(framed),
            reusable: false,
        })
    }

    /// Performs one request/response exchange on a pooled stream.
    pub async fn call(&self, request: Request) -> Result<Response, ProtocolError> {
        let mut handle = self.acquire().await?;
        handle.call(request).await
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    /// Closes every idle stream.
    pub fn clear(&self) {
        let mut closed = 0;
        while self.pop().is_some() {
            closed += 1;
        }
        debug!(closed, "closed idle store connections");
    }

    fn pop(&self) -> Option<Handle<D>> {
        loop {
            match self.idle.steal() {
                Steal::Success(framed) => return Some(framed),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }
}

/// A stream on loan from the pool.
pub struct PooledHandle<'a, D: Dialer> {
    pool: &'a HandlePool<D>,
    framed: Option<Handle<D>>,
    /// Set once an exchange completed cleanly.
    reusable: bool,
}

impl<D: Dialer> PooledHandle<'_, D> {
    pub async fn call(&mut self, request: Request) -> Result<Response, ProtocolError> {
        let framed = self.framed.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        self.reusable = false;

        framed.send(request).await?;
        let response = framed
            .next()
            .await
            .ok_or(ProtocolError::ConnectionClosed)??;

        self.reusable = true;
        Ok(response)
    }
}

impl<D: Dialer> Drop for PooledHandle<'_, D> {
    fn drop(&mut self) {
        if let Some(framed) = self.framed.take() {
            if self.reusable {
                self.pool.idle.push(framed);
            } else {
                debug!("dropping store connection after failed or unfinished call");
            }
        }
    }
}
