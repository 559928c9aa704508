//! Error taxonomy shared by the registry, the transfer coordinator and both
//! wire planes.
//!
//! Every variant has a stable wire code. Control replies carry it as
//! `ERROR <CODE> <message>` and bulk rejection frames carry it in the
//! `code` field.

/// Failure of a single index operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    /// Malformed or oversized control message. Never reaches the registry.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("peer '{peer}' already has content named '{name}'")]
    DuplicateName { peer: String, name: String },

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unknown peer '{0}'")]
    UnknownPeer(String),

    #[error("transfer already in progress for '{name}' of peer '{peer}'")]
    TransferInProgress { peer: String, name: String },

    /// The pending record was deregistered while its upload was in flight.
    #[error("record '{name}' of peer '{peer}' was removed during transfer")]
    RecordRemoved { peer: String, name: String },

    #[error("transfer i/o failed: {0}")]
    TransferIo(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl IndexError {
    /// Stable wire code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            IndexError::BadRequest(_) => "BAD_REQUEST",
            IndexError::DuplicateName { .. } => "DUPLICATE_NAME",
            IndexError::CapacityExceeded(_) => "CAPACITY_EXCEEDED",
            IndexError::NotFound(_) => "NOT_FOUND",
            IndexError::UnknownPeer(_) => "UNKNOWN_PEER",
            IndexError::TransferInProgress { .. } => "TRANSFER_IN_PROGRESS",
            IndexError::RecordRemoved { .. } => "RECORD_REMOVED",
            IndexError::TransferIo(_) => "TRANSFER_IO",
            IndexError::Storage(_) => "STORAGE",
        }
    }

    pub fn io(e: std::io::Error) -> Self {
        IndexError::TransferIo(e.to_string())
    }
}
