//! Error types for the Tessera wire protocol

use thiserror::Error;

/// Result type alias using the protocol error
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while framing, compressing or interpreting wire messages
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O errors from a stream or from the compressor
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Message framing errors (bad prefix, truncated segments)
    #[error("Framing error: {0}")]
    Framing(String),

    /// Stream frame failed its checksum
    #[error("CRC mismatch: expected {expected:x}, got {computed:x}")]
    Checksum {
        /// Checksum stored in the frame
        expected: u32,
        /// Checksum computed over the received bytes
        computed: u32,
    },

    /// A message did not follow the expected schema
    #[error("Schema error: {0}")]
    Schema(String),

    /// An API key cannot be carried by the negotiated protocol version
    #[error("API keys require protocol version {required}, negotiated {negotiated}")]
    ApiKeyUnsupported {
        /// Minimum version that carries API keys
        required: i32,
        /// Version negotiated with the upstream
        negotiated: i32,
    },

    /// Unknown data layout requested for a payload
    #[error("Unsupported data layout: {0}")]
    UnsupportedLayout(String),
}

impl ProtocolError {
    /// Create a framing error
    pub fn framing(msg: impl Into<String>) -> Self {
        Self::Framing(msg.into())
    }

    /// Create a schema error
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }
}
