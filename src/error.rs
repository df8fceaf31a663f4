//! Error types for MCP client operations.
//!
//! The taxonomy distinguishes retryable transport failures from terminal
//! server and connection errors; `with_retry` consults [`Error::is_retryable`]
//! to decide which failures are worth another attempt.

use thiserror::Error;

/// Result type alias using the crate error.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Requested tool name is unknown to every registered server.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Tool name matches tools on multiple servers; the caller must
    /// disambiguate with a server name.
    #[error("tool '{name}' is available on multiple servers {servers:?}; specify a server name")]
    AmbiguousTool {
        /// The ambiguous tool name.
        name: String,
        /// Names of the servers that expose the tool.
        servers: Vec<String>,
    },

    /// Named server absent from the client registry.
    #[error("server not found: {0}")]
    ServerNotFound(String),

    /// Failure during a tool call not otherwise classified.
    #[error("tool call failed: {0}")]
    ToolCall(String),

    /// Transport-level loss, authorization failure, or inability to
    /// establish a session.
    #[error("connection error: {0}")]
    Connection(String),

    /// The peer reported a JSON-RPC error object, or an HTTP 4xx/5xx not
    /// covered by [`Error::Connection`]. `code` carries the JSON-RPC error
    /// code or the HTTP status.
    #[error("server error: {message}")]
    Server {
        /// Message reported by the server.
        message: String,
        /// JSON-RPC error code (negative) or HTTP status (positive).
        code: Option<i64>,
    },

    /// Malformed framing, JSON parse failure, I/O failure, or timeout.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Invalid configuration or server-definition file.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Transport-layer errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// Underlying I/O error.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame or payload could not be parsed.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// An HTTP request could not be sent or its body could not be read.
    #[error("request failed: {0}")]
    Request(String),

    /// A response did not arrive within the configured read timeout.
    #[error("Timeout {0}")]
    Timeout(String),

    /// The transport is closed or the peer went away.
    #[error("connection closed")]
    ConnectionClosed,
}

impl Error {
    /// Build a server error from a JSON-RPC error object.
    pub fn server(message: impl Into<String>, code: impl Into<Option<i64>>) -> Self {
        Self::Server {
            message: message.into(),
            code: code.into(),
        }
    }

    /// Whether a failed operation may be retried.
    ///
    /// Transport failures (I/O, resets, timeouts, malformed frames) and HTTP
    /// 5xx responses are transient; JSON-RPC errors, client errors, and
    /// authorization failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Server { code: Some(c), .. } => (500..=599).contains(c),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Transport(TransportError::InvalidMessage(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retryable() {
        assert!(Error::from(TransportError::ConnectionClosed).is_retryable());
        assert!(Error::from(TransportError::Timeout("after 10s".into())).is_retryable());
        assert!(Error::from(TransportError::Request("connection reset".into())).is_retryable());
    }

    #[test]
    fn http_5xx_is_retryable_4xx_is_not() {
        assert!(Error::server("Server error: HTTP 503", 503).is_retryable());
        assert!(!Error::server("Client error: HTTP 404", 404).is_retryable());
    }

    #[test]
    fn jsonrpc_errors_are_not_retryable() {
        assert!(!Error::server("invalid params", -32602).is_retryable());
        assert!(!Error::Connection("Authorization failed: HTTP 401".into()).is_retryable());
    }

    #[test]
    fn timeout_display_starts_with_timeout() {
        let err = Error::from(TransportError::Timeout(
            "after 10s waiting for response to \"tools/call\"".into(),
        ));
        assert!(err.to_string().starts_with("Timeout"));
    }
}
