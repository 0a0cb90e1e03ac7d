//! Error types used across `pubhub`.
//!
//! Errors are scoped to the narrowest caller that can act on them: admin
//! conflicts go back to the admin caller, protocol errors go back to the
//! offending connection, and listener errors only ever reach `main`.

use thiserror::Error;

/// Failure of an administrative topic operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic already exists: {0}")]
    AlreadyExists(String),
    #[error("topic not found: {0}")]
    NotFound(String),
}

/// A client request that could not be turned into a broker operation.
///
/// The display text is sent back verbatim in the `error.message` field of a
/// `BAD_REQUEST` reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON format")]
    InvalidJson,
    #[error("Unknown message type")]
    UnknownType,
    #[error("Binary frames are not supported")]
    BinaryFrame,
    #[error("{0}")]
    MissingField(&'static str),
}

/// Listener failures surfaced to `main`.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
