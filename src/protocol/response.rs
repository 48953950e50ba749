use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::StoreError;
use crate::protocol::codec::{
    ClientCodec, ServerCodec, decode_frame, get_bool, get_bytes, get_nullable_string,
    get_string, get_u32, get_u64, put_bool, put_bytes, put_nullable_string, put_string,
};
use crate::protocol::{ProtocolError, ReplyKind};

/// Typed result of a successful call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Unit,
    Long(u64),
    Int(u32),
    Bool(bool),
    Bytes(Vec<u8>),
    Name(Option<String>),
}

impl Reply {
    pub fn kind(&self) -> ReplyKind {
        match self {
            Reply::Unit => ReplyKind::Unit,
            Reply::Long(_) => ReplyKind::Long,
            Reply::Int(_) => ReplyKind::Int,
            Reply::Bool(_) => ReplyKind::Bool,
            Reply::Bytes(_) => ReplyKind::Bytes,
            Reply::Name(_) => ReplyKind::NullableString,
        }
    }

    pub fn into_unit(self) -> Result<(), ProtocolError> {
        match self {
            Reply::Unit => Ok(()),
            _ => Err(ProtocolError::UnexpectedReply("unit")),
        }
    }

    pub fn into_long(self) -> Result<u64, ProtocolError> {
        match self {
            Reply::Long(v) => Ok(v),
            _ => Err(ProtocolError::UnexpectedReply("long")),
        }
    }

    pub fn into_int(self) -> Result<u32, ProtocolError> {
        match self {
            Reply::Int(v) => Ok(v),
            _ => Err(ProtocolError::UnexpectedReply("int")),
        }
    }

    pub fn into_bool(self) -> Result<bool, ProtocolError> {
        match self {
            Reply::Bool(v) => Ok(v),
            _ => Err(ProtocolError::UnexpectedReply("bool")),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Reply::Bytes(v) => Ok(v),
            _ => Err(ProtocolError::UnexpectedReply("bytes")),
        }
    }

    pub fn into_name(self) -> Result<Option<String>, ProtocolError> {
        match self {
            Reply::Name(v) => Ok(v),
            _ => Err(ProtocolError::UnexpectedReply("name")),
        }
    }

    fn decode(kind: ReplyKind, src: &mut &[u8], max: usize) -> Result<Self, ProtocolError> {
        let reply = match kind {
            ReplyKind::Unit => Reply::Unit,
            ReplyKind::Long => Reply::Long(get_u64(src)?),
            ReplyKind::Int => Reply::Int(get_u32(src)?),
            ReplyKind::Bool => Reply::Bool(get_bool(src)?),
            ReplyKind::Bytes => Reply::Bytes(get_bytes(src, max)?),
            ReplyKind::NullableString => Reply::Name(get_nullable_string(src, max)?),
        };
        Ok(reply)
    }
}

/// Outcome of one call as sent back by the dispatcher.
///
/// Wire format: success byte, then either the typed result or
/// `kind: string, message: string (nullable)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Success(Reply),
    Failure(StoreError),
}

impl Response {
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Response::Success(reply) => {
                put_bool(dst, true);
                match reply {
                    Reply::Unit => {}
                    Reply::Long(v) => dst.put_u64(*v),
                    Reply::Int(v) => dst.put_u32(*v),
                    Reply::Bool(v) => put_bool(dst, *v),
                    Reply::Bytes(v) => put_bytes(dst, v),
                    Reply::Name(v) => put_nullable_string(dst, v.as_deref()),
                }
            }
            Response::Failure(error) => {
                put_bool(dst, false);
                put_string(dst, error.kind_name());
                put_nullable_string(dst, Some(error.message()));
            }
        }
    }

    /// Decodes the response to a request whose result has shape `kind`.
    ///
    /// A failure naming a kind outside [`StoreError`] is reported as
    /// `ProtocolError::UnknownFailureKind`, carrying the original name and
    /// message.
    pub fn decode(kind: ReplyKind, src: &mut &[u8], max: usize) -> Result<Self, ProtocolError> {
        if get_bool(src)? {
            return Reply::decode(kind, src, max).map(Response::Success);
        }
        let kind = get_string(src, max)?;
        let message = get_nullable_string(src, max)?;
        match StoreError::from_wire(&kind, message.clone()) {
            Some(error) => Ok(Response::Failure(error)),
            None => Err(ProtocolError::UnknownFailureKind { kind, message }),
        }
    }

    pub fn into_result(self) -> Result<Reply, StoreError> {
        match self {
            Response::Success(reply) => Ok(reply),
            Response::Failure(error) => Err(error),
        }
    }
}

impl From<Result<Reply, StoreError>> for Response {
    fn from(result: Result<Reply, StoreError>) -> Self {
        match result {
            Ok(reply) => Response::Success(reply),
            Err(error) => Response::Failure(error),
        }
    }
}

impl Encoder<Response> for ServerCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

impl Decoder for ClientCodec {
    type Item = Response;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(opcode) = self.pending else {
            if src.is_empty() {
                return Ok(None);
            }
            return Err(ProtocolError::UnexpectedResponse);
        };

        let max = self.max_payload_size;
        let response = decode_frame(src, |cursor| {
            Response::decode(opcode.reply_kind(), cursor, max)
        })?;
        if response.is_some() {
            self.pending = None;
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Opcode, Request};

    /// Helper to run a response through a client codec that just sent `request`
    fn decode_reply_to(request: Request, wire: &[u8]) -> Result<Option<Response>, ProtocolError> {
        let mut codec = ClientCodec::new();
        codec.encode(request, &mut BytesMut::new())?;
        let mut bytes = BytesMut::from(wire);
        codec.decode(&mut bytes)
    }

    fn encode_response(response: &Response) -> BytesMut {
        let mut buf = BytesMut::new();
        response.encode(&mut buf);
        buf
    }

    #[test]
    fn test_write_unit_success() {
        let buf = encode_response(&Response::Success(Reply::Unit));
        assert_eq!(&buf[..], &[1u8][..]);
    }

    #[test]
    fn test_write_failure() {
        let buf = encode_response(&Response::Failure(StoreError::Io("x".into())));
        assert_eq!(&buf[..], &[0u8, 0, 0, 0, 2, b'I', b'o', 1, 0, 0, 0, 1, b'x'][..]);
    }

    #[test]
    fn test_object_not_found_is_rebuilt_as_same_kind() {
        let wire = encode_response(&Response::Failure(StoreError::ObjectNotFound(
            "no object 42".into(),
        )));
        let response = decode_reply_to(
            Request::GetObject {
                tid: crate::types::Tid::new(7),
                oid: crate::types::ObjectId::new(42),
                for_update: false,
            },
            &wire,
        )
        .unwrap()
        .unwrap();

        assert_eq!(
            response,
            Response::Failure(StoreError::ObjectNotFound("no object 42".into()))
        );
    }

    #[test]
    fn test_unknown_failure_kind_is_a_decode_error() {
        let mut wire = BytesMut::new();
        put_bool(&mut wire, false);
        put_string(&mut wire, "Mystery");
        put_nullable_string(&mut wire, Some("boom"));

        let result = decode_reply_to(Request::Commit { tid: crate::types::Tid::new(1) }, &wire);
        let Err(ProtocolError::UnknownFailureKind { kind, message }) = result else {
            panic!("expected UnknownFailureKind, got {result:?}")
        };
        assert_eq!(kind, "Mystery");
        assert_eq!(message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_typed_results_follow_request_opcode() {
        let wire = encode_response(&Response::Success(Reply::Bool(true)));
        let response = decode_reply_to(Request::Prepare { tid: crate::types::Tid::new(1) }, &wire)
            .unwrap()
            .unwrap();
        assert_eq!(response, Response::Success(Reply::Bool(true)));

        let wire = encode_response(&Response::Success(Reply::Name(None)));
        let response = decode_reply_to(
            Request::NextBoundName {
                tid: crate::types::Tid::new(1),
                name: Some("a".into()),
            },
            &wire,
        )
        .unwrap()
        .unwrap();
        assert_eq!(response, Response::Success(Reply::Name(None)));
    }

    #[test]
    fn test_partial_response_keeps_request_pending() {
        let wire = encode_response(&Response::Success(Reply::Long(99)));
        let mut codec = ClientCodec::new();
        codec
            .encode(Request::CreateTransaction { timeout_ms: 5 }, &mut BytesMut::new())
            .unwrap();

        let mut partial = BytesMut::from(&wire[..4]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        assert_eq!(codec.pending(), Some(Opcode::CreateTransaction));

        partial.extend_from_slice(&wire[4..]);
        assert_eq!(
            codec.decode(&mut partial).unwrap(),
            Some(Response::Success(Reply::Long(99)))
        );
        assert_eq!(codec.pending(), None);
    }

    #[test]
    fn test_response_without_request_is_rejected() {
        let mut codec = ClientCodec::new();
        let mut bytes = BytesMut::from(&[1u8][..]);
        assert!(matches!(
            codec.decode(&mut bytes),
            Err(ProtocolError::UnexpectedResponse)
        ));
    }

    #[test]
    fn test_reply_accessors_check_shape() {
        assert_eq!(Reply::Long(5).into_long().unwrap(), 5);
        assert!(Reply::Long(5).into_bool().is_err());
        assert_eq!(Reply::Bytes(vec![1]).kind(), ReplyKind::Bytes);
    }
}
