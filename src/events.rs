//! Invalidation events carried over the notification channel.
//!
//! The broadcast trigger serializes one event per committed row mutation.
//! Payloads carry no value bytes: consumers re-read from the database when
//! they need the new value, which keeps notifications small and immune to
//! payload-size limits.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Mutation kind carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOp {
    Upsert,
    Delete,
}

/// A decoded notification payload.
///
/// Wire format is a UTF-8 JSON object:
/// `{"op": "upsert"|"delete", "key": "<base64>", "version": <int>,
/// "expires_at": <iso8601>|null}`. Unknown fields are ignored; a payload
/// missing a required field fails to decode and is discarded by the listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEvent {
    pub op: EventOp,
    /// Base64-encoded key bytes.
    pub key: String,
    pub version: i64,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEvent {
    /// Decode a raw notification payload with strict validation.
    pub fn decode(payload: &str) -> Result<Self> {
        serde_json::from_str(payload)
            .map_err(|e| CacheError::encoding(format!("malformed event payload: {e}")))
    }

    /// Serialize to the wire format.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| CacheError::encoding(format!("event encode failed: {e}")))
    }

    /// The raw key bytes this event refers to.
    pub fn key_bytes(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.key)
            .map_err(|e| CacheError::encoding(format!("event key is not valid base64: {e}")))
    }
}

/// Base64-encode raw key bytes for the wire format.
pub fn encode_key(key: &[u8]) -> String {
    BASE64.encode(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_upsert_event() {
        let payload = r#"{"op":"upsert","key":"aG90LWtleQ==","version":42,"expires_at":"2026-08-02T10:15:30.000123Z"}"#;
        let event = CacheEvent::decode(payload).unwrap();
        assert_eq!(event.op, EventOp::Upsert);
        assert_eq!(event.version, 42);
        assert_eq!(event.key_bytes().unwrap(), b"hot-key");
        assert!(event.expires_at.is_some());
    }

    #[test]
    fn decodes_delete_event_with_null_expiry() {
        let payload = r#"{"op":"delete","key":"aw==","version":7,"expires_at":null}"#;
        let event = CacheEvent::decode(payload).unwrap();
        assert_eq!(event.op, EventOp::Delete);
        assert_eq!(event.expires_at, None);
        assert_eq!(event.key_bytes().unwrap(), b"k");
    }

    #[test]
    fn ignores_unknown_fields() {
        let payload = r#"{"op":"upsert","key":"aw==","version":1,"expires_at":null,"extra":"field"}"#;
        assert!(CacheEvent::decode(payload).is_ok());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        assert!(CacheEvent::decode(r#"{"op":"upsert","key":"aw=="}"#).is_err());
        assert!(CacheEvent::decode(r#"{"key":"aw==","version":1}"#).is_err());
        assert!(CacheEvent::decode("not json").is_err());
    }

    #[test]
    fn invalid_base64_key_is_rejected() {
        let payload = r#"{"op":"delete","key":"%%%","version":3}"#;
        let event = CacheEvent::decode(payload).unwrap();
        assert!(event.key_bytes().is_err());
    }

    #[test]
    fn key_encoding_round_trips() {
        let key = b"writer-3";
        let event = CacheEvent {
            op: EventOp::Upsert,
            key: encode_key(key),
            version: 1,
            expires_at: None,
        };
        assert_eq!(event.key_bytes().unwrap(), key);

        let decoded = CacheEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }
}
