//! Failure taxonomy shared by both ends of the wire.
//!
//! Every failure the server can report is one of the [`StoreError`] variants.
//! On the wire a failure travels as its stable kind name plus its message, and
//! the caller rebuilds the same variant from that pair. The set is closed: an
//! unknown kind name is a protocol decode failure, never a silent fallback.

use crate::types::{ObjectId, Tid};

/// Failures reported by the store, locally or across the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The object does not exist (or was removed).
    #[error("object not found: {0}")]
    ObjectNotFound(String),
    /// No binding exists for the name.
    #[error("name not bound: {0}")]
    NameNotBound(String),
    /// The transaction lost a conflict with another transaction and was aborted.
    #[error("transaction conflict: {0}")]
    TransactionConflict(String),
    /// The transaction was aborted.
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),
    /// The tid is unknown: never created, already finished, or reaped.
    #[error("transaction not active: {0}")]
    TransactionNotActive(String),
    /// The transaction ran past its timeout.
    #[error("transaction timed out: {0}")]
    TransactionTimeout(String),
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// I/O failure on the remote side, or a request it could not decode.
    #[error("remote I/O failure: {0}")]
    Io(String),
    /// Unexpected failure inside the store.
    #[error("internal store failure: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn object_not_found(oid: ObjectId) -> Self {
        StoreError::ObjectNotFound(format!("no object {}", oid))
    }

    pub fn name_not_bound(name: &str) -> Self {
        StoreError::NameNotBound(format!("name not bound: {}", name))
    }

    pub fn not_active(tid: Tid) -> Self {
        StoreError::TransactionNotActive(format!("transaction {} is not active", tid))
    }

    /// Stable name of this failure kind on the wire.
    pub fn kind_name(&self) -> &'static str {
        match self {
            StoreError::ObjectNotFound(_) => "ObjectNotFound",
            StoreError::NameNotBound(_) => "NameNotBound",
            StoreError::TransactionConflict(_) => "TransactionConflict",
            StoreError::TransactionAborted(_) => "TransactionAborted",
            StoreError::TransactionNotActive(_) => "TransactionNotActive",
            StoreError::TransactionTimeout(_) => "TransactionTimeout",
            StoreError::IllegalArgument(_) => "IllegalArgument",
            StoreError::IllegalState(_) => "IllegalState",
            StoreError::Io(_) => "Io",
            StoreError::Internal(_) => "Internal",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            StoreError::ObjectNotFound(m)
            | StoreError::NameNotBound(m)
            | StoreError::TransactionConflict(m)
            | StoreError::TransactionAborted(m)
            | StoreError::TransactionNotActive(m)
            | StoreError::TransactionTimeout(m)
            | StoreError::IllegalArgument(m)
            | StoreError::IllegalState(m)
            | StoreError::Io(m)
            | StoreError::Internal(m) => m,
        }
    }

    /// Rebuilds a failure from its wire kind name and nullable message.
    ///
    /// Returns `None` if the kind is not part of the taxonomy.
    pub fn from_wire(kind: &str, message: Option<String>) -> Option<Self> {
        let message = message.unwrap_or_default();
        let error = match kind {
            "ObjectNotFound" => StoreError::ObjectNotFound(message),
            "NameNotBound" => StoreError::NameNotBound(message),
            "TransactionConflict" => StoreError::TransactionConflict(message),
            "TransactionAborted" => StoreError::TransactionAborted(message),
            "TransactionNotActive" => StoreError::TransactionNotActive(message),
            "TransactionTimeout" => StoreError::TransactionTimeout(message),
            "IllegalArgument" => StoreError::IllegalArgument(message),
            "IllegalState" => StoreError::IllegalState(message),
            "Io" => StoreError::Io(message),
            "Internal" => StoreError::Internal(message),
            _ => return None,
        };
        Some(error)
    }

    /// Whether this failure means the transaction has been aborted.
    pub fn is_aborting(&self) -> bool {
        matches!(
            self,
            StoreError::TransactionConflict(_)
                | StoreError::TransactionAborted(_)
                | StoreError::TransactionTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_survives_wire_names() {
        let errors = [
            StoreError::ObjectNotFound("a".into()),
            StoreError::NameNotBound("b".into()),
            StoreError::TransactionConflict("c".into()),
            StoreError::TransactionAborted("d".into()),
            StoreError::TransactionNotActive("e".into()),
            StoreError::TransactionTimeout("f".into()),
            StoreError::IllegalArgument("g".into()),
            StoreError::IllegalState("h".into()),
            StoreError::Io("i".into()),
            StoreError::Internal("j".into()),
        ];
        for error in errors {
            let rebuilt =
                StoreError::from_wire(error.kind_name(), Some(error.message().to_string()));
            assert_eq!(rebuilt, Some(error));
        }
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        assert_eq!(StoreError::from_wire("NoSuchKind", None), None);
    }

    #[test]
    fn test_null_message_becomes_empty() {
        assert_eq!(
            StoreError::from_wire("Io", None),
            Some(StoreError::Io(String::new()))
        );
    }

    #[test]
    fn test_object_not_found_message() {
        let error = StoreError::object_not_found(ObjectId::new(42));
        assert_eq!(error.message(), "no object 42");
        assert!(!error.is_aborting());
        assert!(StoreError::TransactionConflict(String::new()).is_aborting());
    }
}
