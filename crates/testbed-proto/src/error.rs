//! Error types for the control protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtoError>;

/// Errors raised by the protocol layer.
///
/// Message loss is not an error here. It only shows up as a timeout in the
/// layer that waits for a reply.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Payload or envelope could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Socket setup failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Endpoint address is empty or malformed.
    #[error("invalid endpoint address: {0:?}")]
    InvalidAddress(String),

    /// Payload did not match the shape expected for its message type.
    #[error("unexpected payload for {message_type}: {reason}")]
    UnexpectedPayload {
        /// Message type whose payload was rejected.
        message_type: String,
        /// Decoder message.
        reason: String,
    },
}
