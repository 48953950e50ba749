use bytes::{Buf, BufMut, BytesMut};

use crate::protocol::{Opcode, ProtocolError};

/// Maximum size in bytes of a single variable-length payload (16 MB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Maximum number of elements in a wire array.
pub const MAX_ARRAY_LEN: usize = 1 << 20;

/// Ensures that the cursor has at least `n` bytes remaining.
/// Returns `ProtocolError::InsufficientData` if not, so that incremental
/// decoders can wait for more input.
macro_rules! ensure_remaining {
    ($buf:expr, $n:expr) => {
        if $buf.remaining() < $n {
            return Err(ProtocolError::InsufficientData);
        }
    };
}

pub fn get_u8(src: &mut &[u8]) -> Result<u8, ProtocolError> {
    ensure_remaining!(src, 1);
    Ok(src.get_u8())
}

pub fn get_bool(src: &mut &[u8]) -> Result<bool, ProtocolError> {
    match get_u8(src)? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(ProtocolError::InvalidMessage("boolean out of range")),
    }
}

pub fn get_u16(src: &mut &[u8]) -> Result<u16, ProtocolError> {
    ensure_remaining!(src, 2);
    Ok(src.get_u16())
}

pub fn get_i32(src: &mut &[u8]) -> Result<i32, ProtocolError> {
    ensure_remaining!(src, 4);
    Ok(src.get_i32())
}

pub fn get_u32(src: &mut &[u8]) -> Result<u32, ProtocolError> {
    ensure_remaining!(src, 4);
    Ok(src.get_u32())
}

pub fn get_i64(src: &mut &[u8]) -> Result<i64, ProtocolError> {
    ensure_remaining!(src, 8);
    Ok(src.get_i64())
}

pub fn get_u64(src: &mut &[u8]) -> Result<u64, ProtocolError> {
    ensure_remaining!(src, 8);
    Ok(src.get_u64())
}

/// Reads an i32 length prefix and validates it against `max`.
///
/// The limit is checked before waiting for the payload so that a bogus
/// length cannot make the decoder buffer without bound.
fn get_len(src: &mut &[u8], max: usize) -> Result<usize, ProtocolError> {
    let len = get_i32(src)?;
    if len < 0 {
        return Err(ProtocolError::InvalidMessage("negative length"));
    }
    let len = len as usize;
    if len > max {
        return Err(ProtocolError::TooLarge(len));
    }
    Ok(len)
}

/// Read a length-prefixed byte array.
///
/// Wire format: Int32 length, followed by that many bytes.
pub fn get_bytes(src: &mut &[u8], max: usize) -> Result<Vec<u8>, ProtocolError> {
    let len = get_len(src, max)?;
    ensure_remaining!(src, len);
    let bytes = src[..len].to_vec();
    src.advance(len);
    Ok(bytes)
}

/// Read a length-prefixed UTF-8 string.
pub fn get_string(src: &mut &[u8], max: usize) -> Result<String, ProtocolError> {
    let bytes = get_bytes(src, max)?;
    Ok(String::from_utf8(bytes)?)
}

/// Read a nullable string.
/// Returns None if the presence flag is 0.
///
/// Wire format: presence byte (0 = null, 1 = present), then a string if present.
pub fn get_nullable_string(src: &mut &[u8], max: usize) -> Result<Option<String>, ProtocolError> {
    if get_bool(src)? {
        get_string(src, max).map(Some)
    } else {
        Ok(None)
    }
}

/// Read the element count of a wire array.
pub fn get_array_len(src: &mut &[u8]) -> Result<usize, ProtocolError> {
    get_len(src, MAX_ARRAY_LEN)
}

pub fn put_bool(dst: &mut BytesMut, value: bool) {
    dst.put_u8(u8::from(value));
}

pub fn put_bytes(dst: &mut BytesMut, bytes: &[u8]) {
    dst.put_i32(bytes.len() as i32);
    dst.put_slice(bytes);
}

pub fn put_string(dst: &mut BytesMut, s: &str) {
    put_bytes(dst, s.as_bytes());
}

pub fn put_nullable_string(dst: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            put_bool(dst, true);
            put_string(dst, s);
        }
        None => put_bool(dst, false),
    }
}

/// Runs `parse` over the buffered bytes and consumes them only if a complete
/// frame was decoded. A partial frame leaves `src` untouched.
pub(crate) fn decode_frame<T>(
    src: &mut BytesMut,
    parse: impl FnOnce(&mut &[u8]) -> Result<T, ProtocolError>,
) -> Result<Option<T>, ProtocolError> {
    if src.is_empty() {
        return Ok(None);
    }
    let mut cursor: &[u8] = &src[..];
    match parse(&mut cursor) {
        Ok(item) => {
            let consumed = src.len() - cursor.len();
            src.advance(consumed);
            Ok(Some(item))
        }
        Err(ProtocolError::InsufficientData) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Dispatcher-side codec: decodes `Request`s and encodes `Response`s.
pub struct ServerCodec {
    pub(crate) max_payload_size: usize,
}

impl ServerCodec {
    /// Creates a new ServerCodec with the default maximum payload size.
    pub fn new() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

impl Default for ServerCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller-side codec: encodes `Request`s and decodes `Response`s.
///
/// A response only makes sense relative to the request that produced it, so
/// the codec remembers the opcode of the outstanding request. One request may
/// be outstanding at a time.
pub struct ClientCodec {
    pub(crate) max_payload_size: usize,
    pub(crate) pending: Option<Opcode>,
}

impl ClientCodec {
    /// Creates a new ClientCodec with the default maximum payload size.
    pub fn new() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            pending: None,
        }
    }

    /// Opcode of the request still waiting for its response, if any.
    pub fn pending(&self) -> Option<Opcode> {
        self.pending
    }
}

impl Default for ClientCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_string() {
        let buf = [0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o', b'!'];
        let mut cursor: &[u8] = &buf;
        assert_eq!(get_string(&mut cursor, 64).unwrap(), "hello");
        assert_eq!(cursor, b"!");
    }

    #[test]
    fn test_get_string_incomplete() {
        let buf = [0, 0, 0, 10, b'h', b'i'];
        let mut cursor: &[u8] = &buf;
        assert!(matches!(
            get_string(&mut cursor, 64),
            Err(ProtocolError::InsufficientData)
        ));
    }

    #[test]
    fn test_get_bytes_negative_length() {
        let buf = [0xFF, 0xFF, 0xFF, 0xFF];
        let mut cursor: &[u8] = &buf;
        assert!(matches!(
            get_bytes(&mut cursor, 64),
            Err(ProtocolError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_get_bytes_too_large_fails_before_payload_arrives() {
        let buf = [0, 0, 1, 0];
        let mut cursor: &[u8] = &buf;
        assert!(matches!(
            get_bytes(&mut cursor, 16),
            Err(ProtocolError::TooLarge(256))
        ));
    }

    #[test]
    fn test_nullable_string_distinguishes_null_from_empty() {
        let mut buf = BytesMut::new();
        put_nullable_string(&mut buf, None);
        put_nullable_string(&mut buf, Some(""));
        assert_eq!(&buf[..], &[0u8, 1, 0, 0, 0, 0][..]);

        let mut cursor: &[u8] = &buf;
        assert_eq!(get_nullable_string(&mut cursor, 64).unwrap(), None);
        assert_eq!(
            get_nullable_string(&mut cursor, 64).unwrap(),
            Some(String::new())
        );
    }

    #[test]
    fn test_get_bool_rejects_garbage() {
        let buf = [2];
        let mut cursor: &[u8] = &buf;
        assert!(get_bool(&mut cursor).is_err());
    }

    #[test]
    fn test_decode_frame_leaves_partial_input() {
        let mut buf = BytesMut::from(&[0, 0, 0, 4, b'a'][..]);
        let result = decode_frame(&mut buf, |src| get_string(src, 64)).unwrap();
        assert_eq!(result, None);
        assert_eq!(buf.len(), 5);

        buf.extend_from_slice(b"bcd");
        let result = decode_frame(&mut buf, |src| get_string(src, 64)).unwrap();
        assert_eq!(result, Some("abcd".to_string()));
        assert!(buf.is_empty());
    }
}
