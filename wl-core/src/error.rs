//! Global error types for the Waveline client.
//!
//! All error categories across the workspace are unified into a single
//! `WlError` enum with conversions from underlying library errors.

use thiserror::Error;

/// Convenience type alias for Results using WlError.
pub type WlResult<T> = Result<T, WlError>;

/// Unified error type covering all error categories in Waveline.
#[derive(Error, Debug)]
pub enum WlError {
    // -- Authentication errors --
    /// Bad, missing, or expired credentials. Never retried internally.
    #[error("authentication error: {0}")]
    Authentication(String),

    // -- Network errors --
    /// Transport or network failure. Retried locally up to a bound,
    /// then surfaced.
    #[error("connection error: {0}")]
    Connection(String),

    /// A request or handshake exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Server returned an error response.
    #[error("server error (status {status}): {message}")]
    Server {
        /// HTTP status code or protocol error code.
        status: u16,
        /// Error message from server.
        message: String,
    },

    /// Rate limit hit on the server. Caller decides whether to retry.
    #[error("rate limited: {0}")]
    RateLimit(String),

    // -- Protocol errors --
    /// Malformed frame or payload on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    // -- Caller errors --
    /// Caller-supplied invalid input. Surfaced immediately, never retried.
    #[error("bad parameter: {0}")]
    BadParam(String),

    // -- Media errors --
    /// Media upload/download failed.
    #[error("media error: {0}")]
    Media(String),

    // -- Crypto errors --
    /// Payload encryption/decryption error.
    #[error("crypto error: {0}")]
    Crypto(String),

    // -- Configuration errors --
    /// Failed to load or parse configuration.
    #[error("configuration error: {0}")]
    Config(String),

    // -- File/IO errors --
    /// File system operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // -- Generic --
    /// Wrapping anyhow errors for interop.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WlError {
    /// Whether this error is a transient network failure worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, WlError::Connection(_) | WlError::Timeout(_))
    }
}

impl From<serde_json::Error> for WlError {
    fn from(e: serde_json::Error) -> Self {
        WlError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for WlError {
    fn from(e: toml::de::Error) -> Self {
        WlError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WlError::Protocol("Message too short".to_string());
        assert_eq!(err.to_string(), "protocol error: Message too short");

        let err = WlError::Server {
            status: 503,
            message: "unavailable".into(),
        };
        assert_eq!(err.to_string(), "server error (status 503): unavailable");
    }

    #[test]
    fn test_transient_classification() {
        assert!(WlError::Connection("reset".into()).is_transient());
        assert!(WlError::Timeout("deadline".into()).is_transient());
        assert!(!WlError::Authentication("expired".into()).is_transient());
        assert!(!WlError::BadParam("method".into()).is_transient());
    }
}
