//! TCP server for store clients.
//!
//! This module provides the network layer that accepts client connections,
//! tracks the transactions they create and forwards their calls to the
//! underlying store.
//!
//! ## Architecture
//!
//! ```text
//! +--------+
//! | Server |  <- Accepts TCP connections, owns the reaper
//! +--------+
//!      |
//!      v
//! +------------+     +--------------+     +------------+
//! | Connection | --> | StoreService | --> | LocalStore |
//! +------------+     +--------------+     +------------+
//!                           |
//!                           v
//!                    +-------------+     +--------+
//!                    | TxnRegistry | <-- | Reaper |
//!                    +-------------+     +--------+
//! ```
//!
//! ## Terminology
//!
//! - **Server**: TCP listener that spawns connections
//! - **Connection**: Per-client loop decoding requests and writing responses
//! - **StoreService**: The remote operations, keyed by tid
//! - **Registry**: Live transactions with their in-use markers
//! - **Reaper**: Background task aborting transactions that outlived the timeout

pub mod connection;
pub mod listener;
pub mod reaper;
pub mod registry;
pub mod service;

pub use listener::{Server, ServerError};
pub use service::StoreService;
