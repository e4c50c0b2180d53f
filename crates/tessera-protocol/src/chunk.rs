//! Chunked transfer control messages
//!
//! A large message is announced with a `new` chunk carrying the inner JSON
//! and the size of every trailer segment, then streamed as `payload` chunks
//! that each carry one byte range of one segment. All chunks of a transfer
//! share one `chunk_uid`.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// `msg_type` of every chunk control message
pub const MSG_TYPE_CHUNKED: &str = "chunked";

/// `msg_type` of chunk acknowledgements
pub const MSG_TYPE_ACK: &str = "ACK";

/// Chunk control message, tagged by `chunk_type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "chunk_type", rename_all = "lowercase")]
pub enum ChunkMessage {
    /// Opens a transfer
    New {
        /// Transfer id shared by all chunks
        chunk_uid: String,
        /// Total size of every trailer segment of the inner message
        rest_sizes: Vec<u64>,
        /// The inner message, already stamped with its envelope
        msg: Value,
    },
    /// One byte range of one segment; the bytes travel as the only trailer
    Payload {
        /// Transfer id shared by all chunks
        chunk_uid: String,
        /// Segment the bytes belong to
        rest_index: usize,
        /// Offset of the first byte within that segment
        bytes_start: u64,
    },
    /// Receiver abandoned the transfer
    Cancel {
        /// Transfer id shared by all chunks
        chunk_uid: String,
    },
}

impl ChunkMessage {
    /// Transfer id
    pub fn chunk_uid(&self) -> &str {
        match self {
            Self::New { chunk_uid, .. }
            | Self::Payload { chunk_uid, .. }
            | Self::Cancel { chunk_uid } => chunk_uid,
        }
    }

    /// Render as a `chunked` message, optionally bound to a task
    pub fn to_json(&self, task_uid: Option<&str>) -> Result<Value> {
        let mut value = serde_json::to_value(self)?;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| ProtocolError::schema("Chunk message did not serialize to an object"))?;
        obj.insert("msg_type".into(), Value::String(MSG_TYPE_CHUNKED.into()));
        if let Some(task_uid) = task_uid {
            obj.insert("task_uid".into(), Value::String(task_uid.into()));
        }
        Ok(value)
    }

    /// Parse a `chunked` message
    pub fn from_json(message: &Value) -> Result<Self> {
        serde_json::from_value(message.clone())
            .map_err(|e| ProtocolError::schema(format!("Invalid chunked message: {}", e)))
    }
}

/// Message types that may be carried inside a chunked transfer
pub fn is_chunkable(msg_type: &str) -> bool {
    matches!(msg_type, "graph_update" | "full_graph")
}

/// Acknowledgement sent back for every chunk control message
pub fn ack(task_uid: Option<&str>, success: bool, reason: &str) -> Value {
    json!({
        "msg_type": MSG_TYPE_ACK,
        "task_uid": task_uid,
        "success": success,
        "reason": reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_chunk_json() {
        let msg = ChunkMessage::New {
            chunk_uid: "c1".into(),
            rest_sizes: vec![10, 0],
            msg: json!({"msg_type": "graph_update"}),
        };
        let value = msg.to_json(Some("t1")).unwrap();
        assert_eq!(value["msg_type"], "chunked");
        assert_eq!(value["chunk_type"], "new");
        assert_eq!(value["task_uid"], "t1");
        assert_eq!(value["rest_sizes"], json!([10, 0]));

        assert_eq!(ChunkMessage::from_json(&value).unwrap(), msg);
    }

    #[test]
    fn test_payload_chunk_parse() {
        let value = json!({
            "msg_type": "chunked",
            "chunk_type": "payload",
            "chunk_uid": "c1",
            "rest_index": 1,
            "bytes_start": 4096,
            "protocol_type": "ZEFDB",
        });
        let parsed = ChunkMessage::from_json(&value).unwrap();
        assert_eq!(
            parsed,
            ChunkMessage::Payload {
                chunk_uid: "c1".into(),
                rest_index: 1,
                bytes_start: 4096,
            }
        );
        assert_eq!(parsed.chunk_uid(), "c1");
    }

    #[test]
    fn test_negative_rest_index_rejected() {
        let value = json!({
            "chunk_type": "payload",
            "chunk_uid": "c1",
            "rest_index": -1,
            "bytes_start": 0,
        });
        assert!(ChunkMessage::from_json(&value).is_err());
    }

    #[test]
    fn test_unknown_chunk_type() {
        let value = json!({"chunk_type": "resume", "chunk_uid": "c1"});
        assert!(ChunkMessage::from_json(&value).is_err());
    }

    #[test]
    fn test_chunkable_types() {
        assert!(is_chunkable("graph_update"));
        assert!(is_chunkable("full_graph"));
        assert!(!is_chunkable("token"));
    }
}
