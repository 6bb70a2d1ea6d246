//! Error types for the signaling coordinator

/// Result type alias using the signaling Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while brokering a session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Inbound message that is not part of the signaling protocol
    #[error("Invalid message {0}")]
    InvalidMessage(String),

    /// Session identifier missing or empty
    #[error("Cannot use undefined sessionId")]
    MissingSessionId,

    /// Media backend could not be reached
    #[error("Could not find media server at address {address}: {reason}")]
    BackendUnavailable {
        /// Configured backend address
        address: String,
        /// Underlying connection failure
        reason: String,
    },

    /// Media backend answered a request with an error
    #[error("Backend error {code}: {message}")]
    BackendError {
        /// JSON-RPC error code reported by the backend
        code: i64,
        /// Backend error message
        message: String,
    },

    /// Backend response could not be interpreted
    #[error("Unexpected backend response: {0}")]
    UnexpectedResponse(String),

    /// Invalid argument passed to a pipeline operation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Session was stopped or replaced while its negotiation was in flight
    #[error("Session {0} was stopped during negotiation")]
    SessionStopped(String),

    /// Backend or client connection closed
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error originated at the media backend boundary
    pub fn is_backend_error(&self) -> bool {
        matches!(
            self,
            Error::BackendUnavailable { .. }
                | Error::BackendError { .. }
                | Error::UnexpectedResponse(_)
                | Error::ConnectionClosed(_)
        )
    }

    /// Check if this error was caused by client input
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::InvalidMessage(_) | Error::MissingSessionId)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocketError(e.to_string())
    }
}
