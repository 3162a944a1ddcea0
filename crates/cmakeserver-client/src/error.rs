//! Client error types.

use std::time::Duration;

use cmakeserver_protocol::ProtocolError;
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server answered the request with an `error` message.
    #[error("server rejected request {cookie}: {message}")]
    Server { cookie: String, message: String },

    /// The transport went away while the request was outstanding.
    #[error("connection lost: {reason}")]
    ConnectionLost { reason: String },

    /// The connection is shutting down and accepts no new requests.
    #[error("connection is closing")]
    Closing,

    /// No connection has been established.
    #[error("not connected")]
    NotConnected,

    /// `connect` was called while a connection is still live.
    #[error("already connected")]
    AlreadyConnected,

    /// The server refused the handshake.
    #[error("handshake failed: {message}")]
    Handshake { message: String },

    /// Operation timed out.
    #[error("timeout during {operation} after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing or encoding error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl ClientError {
    pub(crate) fn server(cookie: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Server {
            cookie: cookie.into(),
            message: message.into(),
        }
    }

    pub(crate) fn connection_lost(reason: impl Into<String>) -> Self {
        Self::ConnectionLost {
            reason: reason.into(),
        }
    }

    pub(crate) fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true if the error came from losing the transport.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. })
    }

    /// Returns the server's `errorMessage` for rejected requests.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            Self::Server { message, .. } => Some(message),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_display() {
        let err = ClientError::server("3", "unknown request type");
        assert_eq!(
            err.to_string(),
            "server rejected request 3: unknown request type"
        );
        assert_eq!(err.server_message(), Some("unknown request type"));
        assert!(!err.is_connection_lost());
    }

    #[test]
    fn connection_lost_classification() {
        let err = ClientError::connection_lost("connection closed by server");
        assert!(err.is_connection_lost());
        assert_eq!(err.server_message(), None);
        assert_eq!(err.to_string(), "connection lost: connection closed by server");
    }

    #[test]
    fn timeout_display_includes_duration() {
        let err = ClientError::timeout("handshake", Duration::from_millis(250));
        assert_eq!(err.to_string(), "timeout during handshake after 250ms");
    }

    #[test]
    fn io_conversion() {
        let err: ClientError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed").into();
        assert!(matches!(err, ClientError::Io(_)));
    }

    #[test]
    fn protocol_conversion() {
        let err: ClientError = ProtocolError::NotAnObject.into();
        assert!(matches!(err, ClientError::Protocol(_)));
    }
}
