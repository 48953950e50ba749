pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod store;
pub mod txn;
pub mod types;

pub use client::{ClientError, StoreClient, TxnContext};
pub use config::{ClientConfig, ServerConfig};
pub use error::StoreError;
pub use server::Server;
pub use store::{LocalStore, MemoryStore};
pub use txn::{LocalTransaction, Participant, Transaction};
pub use types::{ClassId, ObjectId, Tid};
