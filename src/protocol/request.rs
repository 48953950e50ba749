use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::codec::{
    ClientCodec, ServerCodec, decode_frame, get_array_len, get_bool, get_bytes, get_i32,
    get_i64, get_nullable_string, get_string, get_u16, get_u32, get_u64, put_bool, put_bytes,
    put_nullable_string, put_string,
};
use crate::protocol::{Opcode, ProtocolError};
use crate::types::{ClassId, ObjectId, Tid};

/// A store operation sent by the caller to the dispatcher.
///
/// Wire format: `opcode (u16) | positional arguments`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    AllocateObjects {
        count: i32,
    },
    MarkForUpdate {
        tid: Tid,
        oid: ObjectId,
    },
    GetObject {
        tid: Tid,
        oid: ObjectId,
        for_update: bool,
    },
    SetObject {
        tid: Tid,
        oid: ObjectId,
        data: Vec<u8>,
    },
    SetObjects {
        tid: Tid,
        oids: Vec<ObjectId>,
        data: Vec<Vec<u8>>,
    },
    RemoveObject {
        tid: Tid,
        oid: ObjectId,
    },
    GetBinding {
        tid: Tid,
        name: String,
    },
    SetBinding {
        tid: Tid,
        name: String,
        oid: ObjectId,
    },
    RemoveBinding {
        tid: Tid,
        name: String,
    },
    /// `name: None` asks for the first bound name.
    NextBoundName {
        tid: Tid,
        name: Option<String>,
    },
    GetClassId {
        tid: Tid,
        class_info: Vec<u8>,
    },
    GetClassInfo {
        tid: Tid,
        class_id: ClassId,
    },
    CreateTransaction {
        timeout_ms: i64,
    },
    Prepare {
        tid: Tid,
    },
    Commit {
        tid: Tid,
    },
    PrepareAndCommit {
        tid: Tid,
    },
    Abort {
        tid: Tid,
    },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::AllocateObjects { .. } => Opcode::AllocateObjects,
            Request::MarkForUpdate { .. } => Opcode::MarkForUpdate,
            Request::GetObject { .. } => Opcode::GetObject,
            Request::SetObject { .. } => Opcode::SetObject,
            Request::SetObjects { .. } => Opcode::SetObjects,
            Request::RemoveObject { .. } => Opcode::RemoveObject,
            Request::GetBinding { .. } => Opcode::GetBinding,
            Request::SetBinding { .. } => Opcode::SetBinding,
            Request::RemoveBinding { .. } => Opcode::RemoveBinding,
            Request::NextBoundName { .. } => Opcode::NextBoundName,
            Request::GetClassId { .. } => Opcode::GetClassId,
            Request::GetClassInfo { .. } => Opcode::GetClassInfo,
            Request::CreateTransaction { .. } => Opcode::CreateTransaction,
            Request::Prepare { .. } => Opcode::Prepare,
            Request::Commit { .. } => Opcode::Commit,
            Request::PrepareAndCommit { .. } => Opcode::PrepareAndCommit,
            Request::Abort { .. } => Opcode::Abort,
        }
    }

    /// The transaction this request runs under, if any.
    pub fn tid(&self) -> Option<Tid> {
        match self {
            Request::AllocateObjects { .. } | Request::CreateTransaction { .. } => None,
            Request::MarkForUpdate { tid, .. }
            | Request::GetObject { tid, .. }
            | Request::SetObject { tid, .. }
            | Request::SetObjects { tid, .. }
            | Request::RemoveObject { tid, .. }
            | Request::GetBinding { tid, .. }
            | Request::SetBinding { tid, .. }
            | Request::RemoveBinding { tid, .. }
            | Request::NextBoundName { tid, .. }
            | Request::GetClassId { tid, .. }
            | Request::GetClassInfo { tid, .. }
            | Request::Prepare { tid }
            | Request::Commit { tid }
            | Request::PrepareAndCommit { tid }
            | Request::Abort { tid } => Some(*tid),
        }
    }

    /// Appends the encoded request to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(self.opcode().as_u16());
        match self {
            Request::AllocateObjects { count } => dst.put_i32(*count),
            Request::MarkForUpdate { tid, oid } | Request::RemoveObject { tid, oid } => {
                dst.put_u64(tid.as_u64());
                dst.put_u64(oid.as_u64());
            }
            Request::GetObject {
                tid,
                oid,
                for_update,
            } => {
                dst.put_u64(tid.as_u64());
                dst.put_u64(oid.as_u64());
                put_bool(dst, *for_update);
            }
            Request::SetObject { tid, oid, data } => {
                dst.put_u64(tid.as_u64());
                dst.put_u64(oid.as_u64());
                put_bytes(dst, data);
            }
            Request::SetObjects { tid, oids, data } => {
                dst.put_u64(tid.as_u64());
                dst.put_i32(oids.len() as i32);
                for oid in oids {
                    dst.put_u64(oid.as_u64());
                }
                dst.put_i32(data.len() as i32);
                for bytes in data {
                    put_bytes(dst, bytes);
                }
            }
            Request::GetBinding { tid, name } | Request::RemoveBinding { tid, name } => {
                dst.put_u64(tid.as_u64());
                put_string(dst, name);
            }
            Request::SetBinding { tid, name, oid } => {
                dst.put_u64(tid.as_u64());
                put_string(dst, name);
                dst.put_u64(oid.as_u64());
            }
            Request::NextBoundName { tid, name } => {
                dst.put_u64(tid.as_u64());
                put_nullable_string(dst, name.as_deref());
            }
            Request::GetClassId { tid, class_info } => {
                dst.put_u64(tid.as_u64());
                put_bytes(dst, class_info);
            }
            Request::GetClassInfo { tid, class_id } => {
                dst.put_u64(tid.as_u64());
                dst.put_u32(class_id.as_u32());
            }
            Request::CreateTransaction { timeout_ms } => dst.put_i64(*timeout_ms),
            Request::Prepare { tid }
            | Request::Commit { tid }
            | Request::PrepareAndCommit { tid }
            | Request::Abort { tid } => dst.put_u64(tid.as_u64()),
        }
    }

    /// Decodes one request from the front of `src`.
    ///
    /// Returns `ProtocolError::InsufficientData` if the request is incomplete.
    pub fn decode(src: &mut &[u8], max: usize) -> Result<Self, ProtocolError> {
        let code = get_u16(src)?;
        let opcode = Opcode::try_from(code).map_err(ProtocolError::UnknownOpcode)?;

        let request = match opcode {
            Opcode::AllocateObjects => Request::AllocateObjects {
                count: get_i32(src)?,
            },
            Opcode::MarkForUpdate => Request::MarkForUpdate {
                tid: get_tid(src)?,
                oid: get_oid(src)?,
            },
            Opcode::GetObject => Request::GetObject {
                tid: get_tid(src)?,
                oid: get_oid(src)?,
                for_update: get_bool(src)?,
            },
            Opcode::SetObject => Request::SetObject {
                tid: get_tid(src)?,
                oid: get_oid(src)?,
                data: get_bytes(src, max)?,
            },
            Opcode::SetObjects => {
                let tid = get_tid(src)?;
                let count = get_array_len(src)?;
                let mut oids = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    oids.push(get_oid(src)?);
                }
                let count = get_array_len(src)?;
                let mut data = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    data.push(get_bytes(src, max)?);
                }
                Request::SetObjects { tid, oids, data }
            }
            Opcode::RemoveObject => Request::RemoveObject {
                tid: get_tid(src)?,
                oid: get_oid(src)?,
            },
            Opcode::GetBinding => Request::GetBinding {
                tid: get_tid(src)?,
                name: get_string(src, max)?,
            },
            Opcode::SetBinding => Request::SetBinding {
                tid: get_tid(src)?,
                name: get_string(src, max)?,
                oid: get_oid(src)?,
            },
            Opcode::RemoveBinding => Request::RemoveBinding {
                tid: get_tid(src)?,
                name: get_string(src, max)?,
            },
            Opcode::NextBoundName => Request::NextBoundName {
                tid: get_tid(src)?,
                name: get_nullable_string(src, max)?,
            },
            Opcode::GetClassId => Request::GetClassId {
                tid: get_tid(src)?,
                class_info: get_bytes(src, max)?,
            },
            Opcode::GetClassInfo => Request::GetClassInfo {
                tid: get_tid(src)?,
                class_id: ClassId::new(get_u32(src)?),
            },
            Opcode::CreateTransaction => Request::CreateTransaction {
                timeout_ms: get_i64(src)?,
            },
            Opcode::Prepare => Request::Prepare { tid: get_tid(src)? },
            Opcode::Commit => Request::Commit { tid: get_tid(src)? },
            Opcode::PrepareAndCommit => Request::PrepareAndCommit { tid: get_tid(src)? },
            Opcode::Abort => Request::Abort { tid: get_tid(src)? },
        };
        Ok(request)
    }
}

fn get_tid(src: &mut &[u8]) -> Result<Tid, ProtocolError> {
    get_u64(src).map(Tid::new)
}

fn get_oid(src: &mut &[u8]) -> Result<ObjectId, ProtocolError> {
    get_u64(src).map(ObjectId::new)
}

impl Decoder for ServerCodec {
    type Item = Request;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let max = self.max_payload_size;
        decode_frame(src, |cursor| Request::decode(cursor, max))
    }
}

impl Encoder<Request> for ClientCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if self.pending.is_some() {
            return Err(ProtocolError::InvalidMessage(
                "request sent while another is outstanding",
            ));
        }
        item.encode(dst);
        self.pending = Some(item.opcode());
        Ok(())
    }
}
