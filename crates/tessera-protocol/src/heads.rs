//! Update-heads and update-payload JSON schemas

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Per-cache progress marker inside a heads message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheHead {
    /// Cache size known to the sender
    pub head: u64,
    /// Cache revision known to the sender
    pub revision: u64,
}

/// `{blobs_head, cache_heads}` as exchanged with the upstream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadsJson {
    /// Blob boundary
    pub blobs_head: u64,
    /// Cache boundaries keyed by cache name
    #[serde(default)]
    pub cache_heads: BTreeMap<String, CacheHead>,
}

impl HeadsJson {
    /// Extract the heads embedded in a message (e.g. a failure response)
    pub fn from_message(message: &Value) -> Result<Self> {
        serde_json::from_value(message.clone())
            .map_err(|e| ProtocolError::schema(format!("Invalid heads in message: {}", e)))
    }

    /// Whether a message carries heads at all
    pub fn present_in(message: &Value) -> bool {
        message.get("blobs_head").is_some()
    }
}

/// One changed cache inside an update payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRange {
    /// Cache name
    pub name: String,
    /// Size before the update
    pub index_lo: u64,
    /// Size after the update
    pub index_hi: u64,
    /// Revision the update applies on top of
    pub revision: u64,
    /// Revision of the cache once the update is applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_after: Option<u64>,
}

/// Payload data layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataLayout {
    /// Current layout
    #[default]
    V0_3_0,
    /// Layout understood by older upstreams
    V0_2_0,
}

impl DataLayout {
    /// Layout string carried in `data_layout_version`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V0_3_0 => "0.3.0",
            Self::V0_2_0 => "0.2.0",
        }
    }

    /// Layout an upstream speaking `protocol_version` expects
    pub fn for_protocol_version(protocol_version: i32) -> Self {
        if protocol_version <= 5 {
            Self::V0_2_0
        } else {
            Self::V0_3_0
        }
    }
}

impl fmt::Display for DataLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataLayout {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "0.3.0" => Ok(Self::V0_3_0),
            "0.2.0" => Ok(Self::V0_2_0),
            other => Err(ProtocolError::UnsupportedLayout(other.to_string())),
        }
    }
}

/// JSON header of a `full_graph` / `graph_update` payload.
///
/// The message carries one trailer segment for the blob range followed by
/// one segment per entry of `caches`, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadHeader {
    /// First blob index in the payload
    pub blob_index_lo: u64,
    /// One past the last blob index in the payload
    pub blob_index_hi: u64,
    /// Graph identity
    pub graph_uid: String,
    /// Latest transaction known complete at `blob_index_hi`
    pub index_of_latest_complete_tx_node: u64,
    /// Hash of the graph from its root up to `blob_index_hi`.
    /// Older upstreams omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_full_graph: Option<u64>,
    /// Layout of the blob bytes
    pub data_layout_version: String,
    /// Changed caches, one trailer segment each
    #[serde(default)]
    pub caches: Vec<CacheRange>,
}

impl PayloadHeader {
    /// Number of trailer segments the payload must carry
    pub fn segment_count(&self) -> usize {
        1 + self.caches.len()
    }

    /// Parsed data layout
    pub fn layout(&self) -> Result<DataLayout> {
        self.data_layout_version.parse()
    }

    /// Parse the payload fields out of a message
    pub fn from_message(message: &Value) -> Result<Self> {
        serde_json::from_value(message.clone())
            .map_err(|e| ProtocolError::schema(format!("Invalid update payload: {}", e)))
    }

    /// Merge the payload fields into an outgoing message object
    pub fn merge_into(&self, message: &mut Value) -> Result<()> {
        let fields = serde_json::to_value(self)?;
        let (Some(target), Value::Object(fields)) = (message.as_object_mut(), fields) else {
            return Err(ProtocolError::schema("Payload header must merge into an object"));
        };
        target.extend(fields);
        Ok(())
    }
}
