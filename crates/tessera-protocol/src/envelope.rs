//! Message envelope and generic response
//!
//! Every outgoing message is stamped with the protocol identity, the
//! negotiated version, the caller credential (`who`) and, once a transfer
//! speed estimate exists, a chunk size hint for the receiver.

use crate::error::{ProtocolError, Result};
use serde_json::{Value, json};

/// Protocol identifier carried by every message
pub const PROTOCOL_TYPE: &str = "ZEFDB";

/// Oldest upstream protocol version this client can talk to
pub const MIN_PROTOCOL_VERSION: i32 = 4;

/// Newest protocol version this client implements
pub const MAX_PROTOCOL_VERSION: i32 = 7;

/// First version that understands chunked transfers
pub const CHUNKED_TRANSFER_MIN_VERSION: i32 = 5;

/// First version that accepts API keys in the `who` block
pub const API_KEY_MIN_VERSION: i32 = 6;

/// Credential presented in the `who` block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Who {
    /// Long-lived API key
    ApiKey(String),
    /// Bearer token derived from a refresh token
    Token(String),
}

impl Who {
    /// Render the `who` value for a given protocol version
    pub fn to_json(&self, protocol_version: i32) -> Result<Value> {
        if protocol_version < API_KEY_MIN_VERSION {
            return match self {
                Who::ApiKey(_) => Err(ProtocolError::ApiKeyUnsupported {
                    required: API_KEY_MIN_VERSION,
                    negotiated: protocol_version,
                }),
                Who::Token(token) => Ok(Value::String(token.clone())),
            };
        }

        Ok(match self {
            Who::ApiKey(key) => json!({ "api_key": key }),
            Who::Token(token) => json!({ "token": token }),
        })
    }
}

/// Fields stamped onto every outgoing message
#[derive(Debug, Clone)]
pub struct EnvelopeHeader {
    /// Negotiated protocol version
    pub protocol_version: i32,
    /// Caller credential
    pub who: Who,
    /// Suggested chunk size in bytes
    pub hint_chunk_size: Option<f64>,
}

impl EnvelopeHeader {
    /// Stamp the envelope fields onto a message object
    pub fn stamp(&self, message: &mut Value) -> Result<()> {
        let who = self.who.to_json(self.protocol_version)?;
        let obj = message
            .as_object_mut()
            .ok_or_else(|| ProtocolError::schema("Outgoing message is not a JSON object"))?;

        obj.insert("protocol_type".into(), Value::String(PROTOCOL_TYPE.into()));
        obj.insert("protocol_version".into(), json!(self.protocol_version));
        obj.insert("who".into(), who);
        if let Some(hint) = self.hint_chunk_size {
            obj.insert("hint_chunk_size".into(), json!(hint));
        }
        Ok(())
    }
}

/// Check the protocol identity of an incoming message
pub fn validate_incoming(message: &Value, negotiated_version: i32) -> Result<()> {
    let protocol_type = message
        .get("protocol_type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::schema("Message has no protocol_type"))?;
    if protocol_type != PROTOCOL_TYPE {
        return Err(ProtocolError::schema(format!(
            "Can't handle protocol type '{}'",
            protocol_type
        )));
    }

    let version = message
        .get("protocol_version")
        .and_then(Value::as_i64)
        .ok_or_else(|| ProtocolError::schema("Message has no protocol_version"))?;
    if version != i64::from(negotiated_version) {
        return Err(ProtocolError::schema(format!(
            "Message uses protocol version {} but the connection negotiated {}",
            version, negotiated_version
        )));
    }
    Ok(())
}

/// Success flag and reason extracted from any response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericResponse {
    /// Whether the upstream reported success
    pub success: bool,
    /// Free-form reason text
    pub reason: String,
}

impl GenericResponse {
    /// Successful response with a reason
    pub fn ok(reason: impl Into<String>) -> Self {
        Self {
            success: true,
            reason: reason.into(),
        }
    }

    /// Failed response with a reason
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: reason.into(),
        }
    }

    /// Interpret `success` (bool or `"0"`/`"1"`) and `reason`/`response`.
    ///
    /// A message without `success` is treated as a success.
    pub fn from_json(message: &Value) -> Result<Self> {
        let Some(success) = message.get("success") else {
            return Ok(Self::ok(""));
        };

        let success = match success {
            Value::Bool(flag) => *flag,
            Value::String(s) if s == "0" => false,
            Value::String(s) if s == "1" => true,
            other => {
                return Err(ProtocolError::schema(format!(
                    "Unknown value for success: {}",
                    other
                )));
            }
        };

        let reason = ["reason", "response"]
            .iter()
            .find_map(|key| message.get(*key))
            .map(|value| match value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            })
            .unwrap_or_default();

        Ok(Self { success, reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_token_new_protocol() {
        let header = EnvelopeHeader {
            protocol_version: 7,
            who: Who::Token("bearer".into()),
            hint_chunk_size: Some(2048.0),
        };
        let mut msg = json!({"msg_type": "token"});
        header.stamp(&mut msg).unwrap();

        assert_eq!(msg["protocol_type"], "ZEFDB");
        assert_eq!(msg["protocol_version"], 7);
        assert_eq!(msg["who"]["token"], "bearer");
        assert_eq!(msg["hint_chunk_size"], 2048.0);
    }

    #[test]
    fn test_stamp_legacy_token_is_plain_string() {
        let header = EnvelopeHeader {
            protocol_version: 5,
            who: Who::Token("bearer".into()),
            hint_chunk_size: None,
        };
        let mut msg = json!({});
        header.stamp(&mut msg).unwrap();
        assert_eq!(msg["who"], "bearer");
        assert!(msg.get("hint_chunk_size").is_none());
    }

    #[test]
    fn test_api_key_needs_newer_protocol() {
        let header = EnvelopeHeader {
            protocol_version: 5,
            who: Who::ApiKey("key".into()),
            hint_chunk_size: None,
        };
        let err = header.stamp(&mut json!({})).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ApiKeyUnsupported {
                required: 6,
                negotiated: 5
            }
        ));

        let mut msg = json!({});
        EnvelopeHeader {
            protocol_version: 6,
            ..header
        }
        .stamp(&mut msg)
        .unwrap();
        assert_eq!(msg["who"]["api_key"], "key");
    }

    #[test]
    fn test_generic_response_variants() {
        assert_eq!(
            GenericResponse::from_json(&json!({})).unwrap(),
            GenericResponse::ok("")
        );
        assert_eq!(
            GenericResponse::from_json(&json!({"success": "0", "reason": "nope"})).unwrap(),
            GenericResponse::failure("nope")
        );
        assert_eq!(
            GenericResponse::from_json(&json!({"success": true, "response": "fine"})).unwrap(),
            GenericResponse::ok("fine")
        );
        assert!(GenericResponse::from_json(&json!({"success": "yes"})).is_err());
    }

    #[test]
    fn test_validate_incoming() {
        let good = json!({"protocol_type": "ZEFDB", "protocol_version": 6});
        assert!(validate_incoming(&good, 6).is_ok());
        assert!(validate_incoming(&good, 7).is_err());
        assert!(validate_incoming(&json!({"protocol_type": "OTHER", "protocol_version": 6}), 6).is_err());
    }
}
