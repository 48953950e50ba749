//! Binary RPC protocol between store clients and the store server.
//!
//! Every call is one request and one response on a single byte stream.
//! Both ends share the framing code and differ only in which codec they use.
//!
//! ## Architecture
//!
//! ```text
//! +-------------+                        +-------------+
//! | StoreClient |  ----- Request  ---->  | Connection  |
//! |  (caller)   |  <---- Response -----  | (dispatcher)|
//! +-------------+                        +-------------+
//!        ^                                      ^
//!        |  ClientCodec                         |  ServerCodec
//!        +--------------------------------------+
//! ```
//!
//! ## Terminology
//!
//! - **Opcode**: 2-byte operation code at the start of every request
//! - **Request**: Opcode plus positional arguments
//! - **Response**: Success flag plus typed result, or a failure (kind name and message)
//! - **Reply**: The typed result of a successful call

pub mod codec;
pub mod error;
pub mod opcode;
pub mod request;
pub mod response;

pub use codec::{ClientCodec, ServerCodec};
pub use error::ProtocolError;
pub use opcode::{Opcode, ReplyKind};
pub use request::Request;
pub use response::{Reply, Response};
