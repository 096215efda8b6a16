//! Error types for docbridge

use thiserror::Error;

/// Result type alias for docbridge operations
pub type Result<T> = std::result::Result<T, DocBridgeError>;

/// Unified error type for all docbridge operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocBridgeError {
    /// URI malformed, network unreachable or liveness probe timed out
    #[error("Connection error: {0}")]
    Connect(String),

    /// Liveness check against an established handle failed
    #[error("Ping failed: {0}")]
    Ping(String),

    #[error("Close error: {0}")]
    Close(String),

    /// The manager was closed; operations do not reconnect implicitly
    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Query error: {0}")]
    Query(String),

    /// A returned document could not be parsed into the expected shape
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation deadline elapsed - retryable
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DocBridgeError {
    /// Returns true if this error is potentially retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DocBridgeError::Connect(_) | DocBridgeError::Ping(_) | DocBridgeError::Timeout(_)
        )
    }

    /// Returns true if the error came from connection management rather than an operation
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            DocBridgeError::Connect(_)
                | DocBridgeError::Ping(_)
                | DocBridgeError::Close(_)
                | DocBridgeError::NotConnected(_)
        )
    }
}

// MongoDB-specific error conversions (when mongodb-errors feature is enabled)
#[cfg(feature = "mongodb-errors")]
impl From<mongodb::error::Error> for DocBridgeError {
    fn from(err: mongodb::error::Error) -> Self {
        use mongodb::error::ErrorKind;

        match err.kind.as_ref() {
            ErrorKind::ServerSelection { .. }
            | ErrorKind::Io(_)
            | ErrorKind::DnsResolve { .. }
            | ErrorKind::Authentication { .. }
            | ErrorKind::ConnectionPoolCleared { .. } => DocBridgeError::Connect(err.to_string()),
            ErrorKind::BsonDeserialization(_) => DocBridgeError::Decode(err.to_string()),
            ErrorKind::BsonSerialization(_) => DocBridgeError::Serialization(err.to_string()),
            _ => DocBridgeError::Query(err.to_string()),
        }
    }
}

#[cfg(feature = "mongodb-errors")]
impl From<bson::ser::Error> for DocBridgeError {
    fn from(err: bson::ser::Error) -> Self {
        DocBridgeError::Serialization(format!("BSON serialization error: {}", err))
    }
}

#[cfg(feature = "mongodb-errors")]
impl From<bson::de::Error> for DocBridgeError {
    fn from(err: bson::de::Error) -> Self {
        DocBridgeError::Decode(format!("BSON deserialization error: {}", err))
    }
}
