//! Client side of the store protocol.
//!
//! ## Architecture
//!
//! ```text
//! +-------------+     +------------+
//! | StoreClient | --> | TxnContext |  <- tid bound to the caller's transaction
//! +-------------+     +------------+
//!        |
//!        v
//! +------------+     +--------+
//! | HandlePool | --> | Dialer |  <- opens streams on demand
//! +------------+     +--------+
//! ```
//!
//! ## Terminology
//!
//! - **StoreClient**: Transactional proxy forwarding every operation to the server
//! - **TxnContext**: Per-caller binding between a local transaction and its tid
//! - **HandlePool**: Idle request streams, one borrowed per call
//! - **Dialer**: Transport factory, TCP by default

pub mod context;
pub mod error;
pub mod pool;
pub mod proxy;

pub use context::TxnContext;
pub use error::ClientError;
pub use pool::{Dialer, HandlePool, TcpDialer};
pub use proxy::StoreClient;
