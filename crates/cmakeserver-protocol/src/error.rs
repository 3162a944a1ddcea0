//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while framing or decoding messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The bytes do not follow the head/tail marker layout.
    #[error("framing error: {reason}")]
    Framing { reason: String },

    /// Frame body is not valid UTF-8.
    #[error("frame body is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// Frame body is not valid JSON, or a value failed to serialize.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame body decoded to JSON that is not an object.
    #[error("message is not a JSON object")]
    NotAnObject,

    /// A required field is absent.
    #[error("missing required field `{field}`")]
    MissingField { field: &'static str },

    /// A field is present but has the wrong JSON type.
    #[error("field `{field}` must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },

    /// A frame grew past the configured size limit without terminating.
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
}

impl ProtocolError {
    /// Creates a framing error.
    pub fn framing(reason: impl Into<String>) -> Self {
        Self::Framing {
            reason: reason.into(),
        }
    }

    /// Returns true for errors raised by marker handling rather than body decoding.
    pub fn is_framing(&self) -> bool {
        matches!(self, Self::Framing { .. } | Self::FrameTooLarge { .. })
    }
}
