//! Error types for the hub
//!
//! Defines hub operation errors, verifier errors and process-level errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::message::MessageType;
use crate::types::ConnectionId;

/// Hub and connection operation errors
///
/// None of these are fatal to the process: each is scoped to one
/// connection or one call, and is turned into an error message on the
/// connection that caused it.
#[derive(Debug, Error)]
pub enum HubError {
    /// Operation on a connection that has been torn down
    #[error("connection closed")]
    ConnectionClosed,

    /// Id was removed by a concurrent unregister or reaper sweep
    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// Outbound queue is at capacity, message dropped
    #[error("send channel full")]
    SendChannelFull,

    /// Request requires an authenticated connection
    #[error("not authenticated")]
    NotAuthenticated,

    /// Connection already bound to an identity
    #[error("already authenticated")]
    AlreadyAuthenticated,

    /// Channel name is empty or too long
    #[error("invalid channel name: {0:?}")]
    InvalidChannel(String),

    /// Well-formed message of a type clients may not send
    #[error("unsupported message type: {0:?}")]
    UnsupportedType(MessageType),

    /// Inbound frame could not be decoded
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Token verification failure reported by an `AuthVerifier`
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct AuthError(pub String);

impl AuthError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Process-level errors
///
/// Returned from server startup and the binary entry point.
#[derive(Debug, Error)]
pub enum AppError {
    /// IO error (bind, accept)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid startup configuration
    #[error("configuration error: {0}")]
    Config(String),
}
