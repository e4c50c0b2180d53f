//! Error types for Tessera Core

use tessera_protocol::ProtocolError;
use thiserror::Error;

/// Result type alias using Tessera Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the Tessera client engine
#[derive(Error, Debug)]
pub enum Error {
    /// Transport not connected, or dropped while a request was outstanding
    #[error("Disconnected from upstream")]
    Disconnected,

    /// A request saw no activity for longer than its inactivity timeout
    #[error("Timed out waiting for upstream")]
    Timeout,

    /// Authentication required but no credential could be resolved
    #[error("No credentials: {0}")]
    NoCredentials(String),

    /// Feature requires a newer protocol than the one negotiated
    #[error("Protocol mismatch: requires version {required}, negotiated {negotiated}")]
    ProtocolMismatch {
        /// Minimum version the feature needs
        required: i32,
        /// Version negotiated with the upstream
        negotiated: i32,
    },

    /// Corrupt credential file or malformed upstream data
    #[error("Malformed data: {0}")]
    Malformed(String),

    /// A cache name not known to this client
    #[error("Unknown cache: {0}")]
    UnknownCache(String),

    /// Upstream rejected authentication irrecoverably
    #[error("Fatal authentication error: {0}")]
    FatalAuth(String),

    /// Upstream answered a request with a failure
    #[error("Upstream replied with failure: {0}")]
    Rejected(String),

    /// Graph sync paused after an unrecognized upstream rejection
    #[error("Graph in invalid state: {0}")]
    GraphInvalidState(String),

    /// I/O errors from storage or sockets
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(ProtocolError),

    /// Region / backing file errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a malformed-data error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Create a no-credentials error
    pub fn no_credentials(msg: impl Into<String>) -> Self {
        Self::NoCredentials(msg.into())
    }

    /// Create a fatal authentication error
    pub fn fatal_auth(msg: impl Into<String>) -> Self {
        Self::FatalAuth(msg.into())
    }

    /// Create an upstream-rejection error
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// Create a graph invalid-state error
    pub fn graph_invalid(msg: impl Into<String>) -> Self {
        Self::GraphInvalidState(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Transient conditions that a caller may retry
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Disconnected | Self::Timeout => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::ApiKeyUnsupported {
                required,
                negotiated,
            } => Self::ProtocolMismatch {
                required,
                negotiated,
            },
            other => Self::Protocol(other),
        }
    }
}
