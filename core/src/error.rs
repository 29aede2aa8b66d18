//! Error types for MeshKit core
//!
//! The taxonomy mirrors how failures are handled at runtime:
//!
//! - **StructuralMerge:** unreachable for well-formed state; fatal to one sync round only
//! - **SemanticConflict:** expected, routed to the conflict engine and audited
//! - **Network:** recovered locally through retry/backoff, never data loss
//! - **InvariantViolation:** freezes the affected instance until inspected

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, SyncError>;

/// Sub-classification of network failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Identity or protocol mismatch during connection setup
    Handshake,
    /// Handshake or delivery round exceeded its deadline
    Timeout,
    /// Remote closed the stream
    Disconnected,
    /// Underlying transport error
    Io,
    /// Frame exceeded the configured size limit
    FrameTooLarge,
    /// Peer is currently excluded from gossip
    Unreachable,
}

/// Main error type for CRDT, conflict and sync operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Structural merge error: {0}")]
    StructuralMerge(String),

    #[error("Semantic conflict on '{object_id}': {description}")]
    SemanticConflict {
        object_id: String,
        description: String,
    },

    #[error("Network error ({kind:?}): {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Instance '{object_id}' is frozen: {reason}")]
    Frozen { object_id: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl SyncError {
    /// Shorthand for building a network error
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        SyncError::Network {
            kind,
            message: message.into(),
        }
    }

    /// Whether the failure should feed the retry/backoff policy
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network { .. })
    }

    /// Whether the owning instance must stop accepting merges
    pub fn is_fatal_for_instance(&self) -> bool {
        matches!(self, SyncError::InvariantViolation(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<prost::DecodeError> for SyncError {
    fn from(err: prost::DecodeError) -> Self {
        SyncError::Protocol(format!("Failed to decode message: {}", err))
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => NetworkErrorKind::Disconnected,
            std::io::ErrorKind::TimedOut => NetworkErrorKind::Timeout,
            _ => NetworkErrorKind::Io,
        };
        SyncError::network(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let err = SyncError::network(NetworkErrorKind::Timeout, "round timed out");
        assert!(err.is_retryable());
        assert!(!err.is_fatal_for_instance());

        let err = SyncError::InvariantViolation("tag reuse".to_string());
        assert!(!err.is_retryable());
        assert!(err.is_fatal_for_instance());
    }

    #[test]
    fn test_io_error_mapping() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        match SyncError::from(io) {
            SyncError::Network { kind, .. } => assert_eq!(kind, NetworkErrorKind::Disconnected),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
