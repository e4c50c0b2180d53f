//! Authentication handshake and post-auth registration messages

use crate::envelope::{MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION, Who};
use crate::error::{ProtocolError, Result};
use serde_json::{Value, json};
use std::fmt;

/// First message sent on a fresh connection
pub fn auth_request(who: &Who) -> Value {
    let mut request = json!({ "desired_protocol_version": MAX_PROTOCOL_VERSION });
    match who {
        Who::Token(token) => request["token"] = Value::String(token.clone()),
        Who::ApiKey(key) => request["api_key"] = Value::String(key.clone()),
    }
    request
}

/// Upstream answer to the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthReply {
    /// Authenticated at the negotiated version
    Success {
        /// Version both sides will speak
        negotiated_version: i32,
    },
    /// Upstream speaks a version older than we support
    TooOld {
        /// Version the upstream asked for
        upstream_version: i32,
    },
    /// Upstream rejected the credential
    Failed,
    /// Reconnect elsewhere
    Redirect {
        /// New upstream URI
        target: String,
    },
}

impl AuthReply {
    /// Interpret a handshake reply
    pub fn from_message(message: &Value) -> Result<Self> {
        let msg_type = message
            .get("msg_type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::schema("Handshake reply has no msg_type"))?;

        match msg_type {
            "failed_auth" => Ok(Self::Failed),
            "redirect" => {
                let target = message
                    .get("target")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ProtocolError::schema("Redirect without target"))?;
                Ok(Self::Redirect {
                    target: target.to_string(),
                })
            }
            "auth_success" => {
                let upstream = message
                    .get("desired_protocol_version")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| {
                        ProtocolError::schema("auth_success without desired_protocol_version")
                    })? as i32;
                if upstream < MIN_PROTOCOL_VERSION {
                    return Ok(Self::TooOld {
                        upstream_version: upstream,
                    });
                }
                Ok(Self::Success {
                    negotiated_version: upstream.min(MAX_PROTOCOL_VERSION),
                })
            }
            other => Err(ProtocolError::schema(format!(
                "Unexpected message when expecting auth response: {}",
                other
            ))),
        }
    }
}

/// Host metadata announced after authentication
pub fn register_metadata(hostname: &str, client_version: i32) -> Value {
    json!({
        "msg_type": "register_metadata",
        "hostname": hostname,
        "client_version": client_version,
    })
}

/// Token groups kept in the upstream token store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenGroup {
    /// Entity types
    ET,
    /// Relation types
    RT,
    /// Enum values
    EN,
    /// Keywords
    KW,
}

impl TokenGroup {
    /// All groups, in request order
    pub const ALL: [TokenGroup; 4] = [Self::ET, Self::RT, Self::EN, Self::KW];

    /// Wire name of the group
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ET => "ET",
            Self::RT => "RT",
            Self::EN => "EN",
            Self::KW => "KW",
        }
    }
}

impl fmt::Display for TokenGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request the full token list
pub fn token_list() -> Value {
    json!({
        "msg_type": "token",
        "msg_version": 1,
        "action": "list",
    })
}

/// Validate locally cached token indices for one group
pub fn token_query(group: TokenGroup, indices: &[u64]) -> Value {
    json!({
        "msg_type": "token",
        "msg_version": 1,
        "action": "query",
        "group": group.as_str(),
        "indices": indices,
    })
}
