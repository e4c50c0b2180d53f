//! Stream frame codec for byte-stream transports
//!
//! Transports that do not preserve message boundaries (plain TCP) wrap each
//! compressed message in a frame validated with CRC32:
//!
//! ```text
//! [kind:1][length:4][payload:N][crc32:4]
//! ```

use crate::error::{ProtocolError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use crc32fast::Hasher;
use std::io::{Read, Write};

/// Header size: kind(1) + length(4)
const HEADER_LEN: usize = 5;
/// Trailer size: crc32(4)
const CRC_LEN: usize = 4;
/// Upper bound on a single frame payload
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Frame kinds
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Compressed wire message
    Message = 0x01,
    /// Orderly close from the sender
    Close = 0xFF,
}

impl TryFrom<u8> for FrameKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Message),
            0xFF => Ok(Self::Close),
            _ => Err(ProtocolError::framing(format!("Unknown frame kind: {}", value))),
        }
    }
}

/// One frame on the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind
    pub kind: FrameKind,
    /// Frame payload
    pub payload: Bytes,
}

impl Frame {
    /// Frame carrying a compressed message
    pub fn message(payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Message,
            payload,
        }
    }

    /// Close frame
    pub fn close() -> Self {
        Self {
            kind: FrameKind::Close,
            payload: Bytes::new(),
        }
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes> {
        if self.payload.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::framing(format!(
                "Frame of {} bytes exceeds the {} byte limit",
                self.payload.len(),
                MAX_FRAME_LEN
            )));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len() + CRC_LEN);
        buf.put_u8(self.kind as u8);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);

        // CRC32 of kind + length + payload
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        buf.put_u32_le(hasher.finalize());

        Ok(buf.freeze())
    }

    /// Decode frame from bytes
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN + CRC_LEN {
            return Err(ProtocolError::framing("Frame too short"));
        }

        let crc_offset = buf.len() - CRC_LEN;
        let expected = read_u32_le(&buf[crc_offset..]);
        let mut hasher = Hasher::new();
        hasher.update(&buf[..crc_offset]);
        let computed = hasher.finalize();
        if expected != computed {
            return Err(ProtocolError::Checksum { expected, computed });
        }

        let kind = FrameKind::try_from(buf[0])?;
        let length = read_u32_le(&buf[1..HEADER_LEN]) as usize;
        if HEADER_LEN + length != crc_offset {
            return Err(ProtocolError::framing("Incomplete frame"));
        }

        Ok(Self {
            kind,
            payload: Bytes::copy_from_slice(&buf[HEADER_LEN..crc_offset]),
        })
    }

    /// Write frame to a blocking stream
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let buf = self.encode()?;
        writer.write_all(&buf)?;
        writer.flush()?;
        Ok(())
    }

    /// Read frame from a blocking stream
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header)?;

        let length = read_u32_le(&header[1..]) as usize;
        if length > MAX_FRAME_LEN {
            return Err(ProtocolError::framing(format!(
                "Announced frame length {} exceeds the limit",
                length
            )));
        }

        let mut full = vec![0u8; HEADER_LEN + length + CRC_LEN];
        full[..HEADER_LEN].copy_from_slice(&header);
        reader.read_exact(&mut full[HEADER_LEN..])?;

        Self::decode(&full)
    }
}

fn read_u32_le(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(word)
}
