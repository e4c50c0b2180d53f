//! Tessera Protocol - wire format for the replicated graph client
//!
//! Provides:
//! - Message framing (`[lengths]|json segments`, zstd-compressed)
//! - Stream frames with CRC32 validation for byte-stream transports
//! - The `ZEFDB` envelope, credentials block and generic response
//! - Handshake, registration and token messages
//! - Chunked transfer control messages
//! - Update-heads and update-payload schemas
//!
//! # Message layering
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  JSON message (envelope + msg fields)    │
//! │  + raw trailer segments                  │
//! └──────────────┬───────────────────────────┘
//!                │ WireMessage::encode
//! ┌──────────────┴───────────────────────────┐
//! │  zstd([len,...]|json seg...)             │
//! └──────────────┬───────────────────────────┘
//!                │ Frame (stream transports only)
//! ┌──────────────┴───────────────────────────┐
//! │  [kind:1][length:4][payload:N][crc32:4]  │
//! └──────────────────────────────────────────┘
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod heads;
pub mod message;

pub use chunk::ChunkMessage;
pub use envelope::{
    API_KEY_MIN_VERSION, CHUNKED_TRANSFER_MIN_VERSION, EnvelopeHeader, GenericResponse,
    MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION, PROTOCOL_TYPE, Who,
};
pub use error::{ProtocolError, Result};
pub use frame::{Frame, FrameKind};
pub use handshake::{AuthReply, TokenGroup};
pub use heads::{CacheHead, CacheRange, DataLayout, HeadsJson, PayloadHeader};
pub use message::WireMessage;
