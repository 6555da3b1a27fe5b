//! Error types for the voice pipeline

use serde::Serialize;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Microphone or speaker denied or missing
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// STT/TTS/LLM socket or request failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed or unexpected message from a service
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No data within a bounded window
    #[error("timed out: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio encoding or decoding error
    #[error("audio error: {0}")]
    Audio(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(e.to_string())
    }
}

impl Error {
    /// Classify this error into the pipeline's error taxonomy
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            Self::Protocol(_) | Self::Serialization(_) => ErrorKind::ProtocolError,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Connection(_) | Self::Http(_) | Self::Io(_) => ErrorKind::ConnectionError,
            Self::Config(_) | Self::Toml(_) | Self::Audio(_) => ErrorKind::ProtocolError,
        }
    }
}

/// Error taxonomy surfaced to pipeline observers in error events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Fatal to the current session; requires user action
    DeviceUnavailable,
    /// Socket failure; results for the in-flight utterance or turn are discarded
    ConnectionError,
    /// Malformed message; the subsystem stream is torn down and reopened on next use
    ProtocolError,
    /// No data within the bounded window; handled like a connection error
    Timeout,
    /// Barge-in or explicit stop; a normal transition, not a failure
    UserCancelled,
}

impl ErrorKind {
    /// Whether the controller should handle this kind as a dropped connection
    #[must_use]
    pub const fn is_connection_failure(self) -> bool {
        matches!(self, Self::ConnectionError | Self::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_handled_as_connection_failure() {
        let err = Error::Timeout("llm idle".to_string());
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.kind().is_connection_failure());
        assert!(!ErrorKind::ProtocolError.is_connection_failure());
    }

    #[test]
    fn malformed_json_is_protocol_error() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }
}
