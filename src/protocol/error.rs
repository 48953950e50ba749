use std::string::FromUtf8Error;

/// Wire decoding and transport errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The buffer does not yet hold a complete frame.
    #[error("insufficient data")]
    InsufficientData,
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),
    #[error("unknown opcode: {0}")]
    UnknownOpcode(u16),
    /// A failure response named a kind outside the taxonomy.
    #[error("cannot rebuild remote failure of kind {kind:?} (message: {message:?})")]
    UnknownFailureKind {
        kind: String,
        message: Option<String>,
    },
    /// A response arrived with no request outstanding on the stream.
    #[error("unexpected response: no request pending")]
    UnexpectedResponse,
    /// A successful response carried a result of the wrong shape.
    #[error("unexpected reply for {0}")]
    UnexpectedReply(&'static str),
    #[error("length {0} exceeds the maximum payload size")]
    TooLarge(usize),
    /// The peer closed the stream before the response was read.
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
