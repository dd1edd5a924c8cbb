//! Git protocol error types.

use githost_storage::ObjectId;
use thiserror::Error;

/// Errors that can occur during git protocol operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// Malformed framing or an illegal request for the current state.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The pack stream is malformed, truncated, or fails its checksum.
    #[error("corrupt pack: {0}")]
    CorruptPack(String),

    /// A pack entry carries a reserved type code.
    #[error("unknown object type {0} in pack")]
    UnknownObjectType(u8),

    /// A pack entry inflates to more than the configured limit.
    #[error("object of {size} bytes exceeds the {limit} byte limit")]
    OversizeObject {
        /// Declared or computed object size.
        size: u64,
        /// Configured `max_object_size`.
        limit: u64,
    },

    /// The pack stream is longer than the configured limit.
    #[error("pack exceeds the {limit} byte limit")]
    PackTooLarge {
        /// Configured `max_pack_bytes`.
        limit: u64,
    },

    /// A pushed tip references objects neither in the pack nor in the store.
    #[error("{tip} is missing {} reachable objects", missing.len())]
    IncompleteObjectGraph {
        /// The pushed tip that was walked.
        tip: ObjectId,
        /// Objects that could not be found.
        missing: Vec<ObjectId>,
    },

    /// The client asked for an object the server does not have.
    #[error("unknown want {0}")]
    UnknownWant(ObjectId),

    /// The access-control collaborator refused the request.
    #[error("unauthorized")]
    Unauthorized,

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// The request ran past its deadline.
    #[error("request timed out")]
    TimedOut,

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] githost_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    /// True when the client spoke the protocol wrongly and the transport
    /// should drop the connection instead of answering.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::UnknownWant(_))
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
