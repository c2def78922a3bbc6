//! Core error types.

use thiserror::Error;

/// Errors from the state machine engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid model definition: {reason}")]
    InvalidModel { reason: String },

    #[error("invalid guard expression: {reason}")]
    InvalidGuard { reason: String },

    #[error("unknown variable kind '{kind}' for variable '{variable}'")]
    UnknownVariableKind { variable: String, kind: String },

    #[error("event '{event}' received after the stream was finalized")]
    StreamFinalized { event: String },

    #[error("adaptive constraints were already finalized")]
    AlreadyFinalized,

    #[error("stream not finalized: call finished_receiving() first")]
    NotFinalized,

    #[error("out-of-order event '{event}': timestamp {timestamp} precedes {previous}")]
    OutOfOrder {
        event: String,
        timestamp: u64,
        previous: u64,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Returns whether this error is a violation of the streaming protocol
    /// (as opposed to a bad model).
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            CoreError::StreamFinalized { .. }
                | CoreError::AlreadyFinalized
                | CoreError::NotFinalized
                | CoreError::OutOfOrder { .. }
        )
    }

    /// Returns a stable error code suitable for logs and exit reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidModel { .. } => "INVALID_MODEL",
            CoreError::InvalidGuard { .. } => "INVALID_GUARD",
            CoreError::UnknownVariableKind { .. } => "INVALID_MODEL",
            CoreError::StreamFinalized { .. } => "PROTOCOL_VIOLATION",
            CoreError::AlreadyFinalized => "PROTOCOL_VIOLATION",
            CoreError::NotFinalized => "PROTOCOL_VIOLATION",
            CoreError::OutOfOrder { .. } => "OUT_OF_ORDER",
            CoreError::Json(_) => "BAD_INPUT",
        }
    }
}
