use std::fmt;

/// Operation codes of the store protocol (first two bytes of every request).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    AllocateObjects = 1,
    MarkForUpdate = 2,
    GetObject = 3,
    SetObject = 4,
    SetObjects = 5,
    RemoveObject = 6,
    GetBinding = 7,
    SetBinding = 8,
    RemoveBinding = 9,
    NextBoundName = 10,
    GetClassId = 11,
    GetClassInfo = 12,
    CreateTransaction = 13,
    Prepare = 14,
    Commit = 15,
    PrepareAndCommit = 16,
    Abort = 17,
}

impl TryFrom<u16> for Opcode {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Opcode::AllocateObjects),
            2 => Ok(Opcode::MarkForUpdate),
            3 => Ok(Opcode::GetObject),
            4 => Ok(Opcode::SetObject),
            5 => Ok(Opcode::SetObjects),
            6 => Ok(Opcode::RemoveObject),
            7 => Ok(Opcode::GetBinding),
            8 => Ok(Opcode::SetBinding),
            9 => Ok(Opcode::RemoveBinding),
            10 => Ok(Opcode::NextBoundName),
            11 => Ok(Opcode::GetClassId),
            12 => Ok(Opcode::GetClassInfo),
            13 => Ok(Opcode::CreateTransaction),
            14 => Ok(Opcode::Prepare),
            15 => Ok(Opcode::Commit),
            16 => Ok(Opcode::PrepareAndCommit),
            17 => Ok(Opcode::Abort),
            _ => Err(value),
        }
    }
}

impl Opcode {
    /// Converts the Opcode to its wire value.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Shape of the result that follows a successful response to this opcode.
    pub fn reply_kind(self) -> ReplyKind {
        match self {
            Opcode::AllocateObjects | Opcode::GetBinding | Opcode::CreateTransaction => {
                ReplyKind::Long
            }
            Opcode::GetObject | Opcode::GetClassInfo => ReplyKind::Bytes,
            Opcode::NextBoundName => ReplyKind::NullableString,
            Opcode::GetClassId => ReplyKind::Int,
            Opcode::Prepare => ReplyKind::Bool,
            Opcode::MarkForUpdate
            | Opcode::SetObject
            | Opcode::SetObjects
            | Opcode::RemoveObject
            | Opcode::SetBinding
            | Opcode::RemoveBinding
            | Opcode::Commit
            | Opcode::PrepareAndCommit
            | Opcode::Abort => ReplyKind::Unit,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::AllocateObjects => "allocateObjects",
            Opcode::MarkForUpdate => "markForUpdate",
            Opcode::GetObject => "getObject",
            Opcode::SetObject => "setObject",
            Opcode::SetObjects => "setObjects",
            Opcode::RemoveObject => "removeObject",
            Opcode::GetBinding => "getBinding",
            Opcode::SetBinding => "setBinding",
            Opcode::RemoveBinding => "removeBinding",
            Opcode::NextBoundName => "nextBoundName",
            Opcode::GetClassId => "getClassId",
            Opcode::GetClassInfo => "getClassInfo",
            Opcode::CreateTransaction => "createTransaction",
            Opcode::Prepare => "prepare",
            Opcode::Commit => "commit",
            Opcode::PrepareAndCommit => "prepareAndCommit",
            Opcode::Abort => "abort",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result shapes carried by successful responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Unit,
    Long,
    Int,
    Bool,
    Bytes,
    NullableString,
}
