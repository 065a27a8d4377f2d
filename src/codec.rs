//! Value serialization between callers and the database payload column.

use serde_json::Value;

use crate::error::{CacheError, Result};

/// Format tag for the default JSON encoding.
pub const FORMAT_JSON: u8 = 0x01;

/// Encodes and decodes cached values to the byte payload stored in the
/// database.
///
/// The trait operates on [`serde_json::Value`] so it stays object-safe;
/// typed conversion happens at the facade. Implementations must satisfy
/// `decode(encode(v)) == v` for every supported value.
pub trait ValueCodec: Send + Sync {
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

/// Default codec: a self-describing payload whose first byte identifies the
/// format, followed by compact JSON. The tag byte allows forward migration
/// to a different encoding without a schema change.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ValueCodec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(128);
        buf.push(FORMAT_JSON);
        serde_json::to_writer(&mut buf, value)
            .map_err(|e| CacheError::encoding(format!("value encode failed: {e}")))?;
        Ok(buf)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        match bytes.split_first() {
            Some((&FORMAT_JSON, body)) => serde_json::from_slice(body)
                .map_err(|e| CacheError::encoding(format!("value decode failed: {e}"))),
            Some((tag, _)) => Err(CacheError::encoding(format!(
                "unknown payload format tag {tag:#04x}"
            ))),
            None => Err(CacheError::encoding("empty payload")),
        }
    }
}
