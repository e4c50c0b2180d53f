//! Binary message framing
//!
//! Every upstream message is one JSON object followed by zero or more raw
//! binary segments. The uncompressed layout is:
//!
//! ```text
//! [len_json,len_seg1,...,len_segN]|<json><seg1>...<segN>
//! ```
//!
//! and the whole buffer is zstd-compressed before it reaches the transport.

use crate::error::{ProtocolError, Result};
use crate::frame::MAX_FRAME_LEN;
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use std::io::Read;

/// zstd level used for outgoing messages
pub const COMPRESSION_LEVEL: i32 = 10;

/// A decoded wire message: JSON header plus raw trailer segments
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    /// Main JSON object
    pub json: Value,
    /// Raw binary trailer segments, in order
    pub segments: Vec<Bytes>,
}

impl WireMessage {
    /// Create a message without trailer segments
    pub fn new(json: Value) -> Self {
        Self {
            json,
            segments: Vec::new(),
        }
    }

    /// Create a message with trailer segments
    pub fn with_segments(json: Value, segments: Vec<Bytes>) -> Self {
        Self { json, segments }
    }

    /// `msg_type` field, if present
    pub fn msg_type(&self) -> Option<&str> {
        self.json.get("msg_type").and_then(Value::as_str)
    }

    /// `task_uid` field, if present and a string
    pub fn task_uid(&self) -> Option<&str> {
        self.json.get("task_uid").and_then(Value::as_str)
    }

    /// Total size of all trailer segments
    pub fn segments_len(&self) -> usize {
        self.segments.iter().map(Bytes::len).sum()
    }

    /// Lay out the uncompressed `[lengths]|json segments` buffer
    pub fn to_raw(&self) -> Result<Bytes> {
        let main = serde_json::to_vec(&self.json)?;

        let mut lengths = Vec::with_capacity(1 + self.segments.len());
        lengths.push(main.len());
        lengths.extend(self.segments.iter().map(Bytes::len));
        let prefix = serde_json::to_vec(&lengths)?;

        let mut buf = BytesMut::with_capacity(prefix.len() + 1 + main.len() + self.segments_len());
        buf.put_slice(&prefix);
        buf.put_u8(b'|');
        buf.put_slice(&main);
        for segment in &self.segments {
            buf.put_slice(segment);
        }
        Ok(buf.freeze())
    }

    /// Parse an uncompressed `[lengths]|json segments` buffer
    pub fn from_raw(raw: &[u8]) -> Result<Self> {
        let split = raw
            .iter()
            .position(|&b| b == b'|')
            .ok_or_else(|| ProtocolError::framing("Message doesn't contain a length prefix"))?;

        let lengths: Vec<u64> = serde_json::from_slice(&raw[..split]).map_err(|e| {
            ProtocolError::framing(format!("Message prefix is not an array of lengths: {}", e))
        })?;
        if lengths.is_empty() {
            return Err(ProtocolError::framing("Message had no content"));
        }

        let body = &raw[split + 1..];
        let mut cursor = 0usize;
        let mut parts = Vec::with_capacity(lengths.len());
        for length in lengths {
            let length = length as usize;
            let end = cursor
                .checked_add(length)
                .filter(|end| *end <= body.len())
                .ok_or_else(|| {
                    ProtocolError::framing(format!(
                        "Segment of {} bytes at offset {} overruns a body of {} bytes",
                        length,
                        cursor,
                        body.len()
                    ))
                })?;
            parts.push(&body[cursor..end]);
            cursor = end;
        }

        let json: Value = serde_json::from_slice(parts[0])?;
        if !json.is_object() {
            return Err(ProtocolError::schema("Main message is not a JSON object"));
        }
        let segments = parts[1..]
            .iter()
            .map(|part| Bytes::copy_from_slice(part))
            .collect();

        Ok(Self { json, segments })
    }

    /// Frame and compress the message for the transport
    pub fn encode(&self) -> Result<Bytes> {
        let raw = self.to_raw()?;
        let compressed = zstd::encode_all(&raw[..], COMPRESSION_LEVEL)?;
        Ok(Bytes::from(compressed))
    }

    /// Decompress and parse a message received from the transport
    pub fn decode(buf: &[u8]) -> Result<Self> {
        Self::decode_limited(buf, MAX_FRAME_LEN)
    }

    /// Like [`WireMessage::decode`], refusing messages that decompress to
    /// more than `limit` bytes
    pub fn decode_limited(buf: &[u8], limit: usize) -> Result<Self> {
        let not_zstd =
            |e: std::io::Error| ProtocolError::framing(format!("Not a zstd compressed message: {}", e));
        let mut raw = Vec::new();
        zstd::Decoder::new(buf)
            .map_err(not_zstd)?
            .take(limit as u64 + 1)
            .read_to_end(&mut raw)
            .map_err(not_zstd)?;
        if raw.len() > limit {
            return Err(ProtocolError::framing(format!(
                "Decompressed message exceeds {} bytes",
                limit
            )));
        }
        Self::from_raw(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_layout() {
        let msg = WireMessage::with_segments(
            json!({"msg_type": "ping"}),
            vec![Bytes::from_static(b"abc"), Bytes::from_static(b"")],
        );
        let raw = msg.to_raw().unwrap();
        let main = serde_json::to_vec(&msg.json).unwrap();
        let expected_prefix = format!("[{},3,0]|", main.len());
        assert!(raw.starts_with(expected_prefix.as_bytes()));
        assert!(raw.ends_with(b"abc"));
    }

    #[test]
    fn test_encode_decode_with_segments() {
        let blob: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let msg = WireMessage::with_segments(
            json!({"msg_type": "graph_update", "task_uid": "t-1"}),
            vec![Bytes::from(blob.clone()), Bytes::from_static(b"cache")],
        );

        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.msg_type(), Some("graph_update"));
        assert_eq!(decoded.task_uid(), Some("t-1"));
        assert_eq!(decoded.segments[0].as_ref(), blob.as_slice());
    }

    #[test]
    fn test_missing_prefix() {
        let err = WireMessage::from_raw(b"{\"a\":1}").unwrap_err();
        assert!(matches!(err, ProtocolError::Framing(_)));
    }

    #[test]
    fn test_empty_prefix() {
        let err = WireMessage::from_raw(b"[]|").unwrap_err();
        assert!(matches!(err, ProtocolError::Framing(_)));
    }

    #[test]
    fn test_truncated_segment() {
        let err = WireMessage::from_raw(b"[2,10]|{}abc").unwrap_err();
        assert!(matches!(err, ProtocolError::Framing(_)));
    }

    #[test]
    fn test_non_object_main_message() {
        let err = WireMessage::from_raw(b"[3]|[1]").unwrap_err();
        assert!(matches!(err, ProtocolError::Schema(_)));
    }

    #[test]
    fn test_decode_rejects_uncompressed() {
        assert!(WireMessage::decode(b"[2]|{}").is_err());
    }

    #[test]
    fn test_decode_caps_decompressed_size() {
        let msg = WireMessage::with_segments(
            json!({"msg_type": "full_graph"}),
            vec![Bytes::from(vec![0u8; 64 * 1024])],
        );
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 4096);

        let err = WireMessage::decode_limited(&encoded, 4096).unwrap_err();
        assert!(matches!(err, ProtocolError::Framing(_)));
        assert_eq!(WireMessage::decode_limited(&encoded, 128 * 1024).unwrap(), msg);
    }

    proptest::proptest! {
        #[test]
        fn test_from_raw_never_panics(raw in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..256)) {
            let _ = WireMessage::from_raw(&raw);
        }

        #[test]
        fn test_from_raw_with_valid_prefix_never_panics(
            lengths in proptest::collection::vec(0u64..64, 1..5),
            body in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..128),
        ) {
            let mut raw = serde_json::to_vec(&lengths).unwrap();
            raw.push(b'|');
            raw.extend_from_slice(&body);
            let _ = WireMessage::from_raw(&raw);
        }
    }
}
