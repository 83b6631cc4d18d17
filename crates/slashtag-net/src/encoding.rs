//! Wire encodings for individual channel messages

use bytes::Bytes;
use slashtag_core::{Error, Result};

/// Declared encoding of one message kind in a protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    /// Varint-length-prefixed UTF-8
    String,
    /// Varint-length-prefixed bytes
    Buffer,
    /// Varint unsigned integer
    Uint,
    /// JSON document
    Json,
}

/// A decoded message value
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    String(String),
    Buffer(Bytes),
    Uint(u64),
    Json(serde_json::Value),
}

impl Value {
    /// Name of the encoding this value belongs to
    pub fn kind(&self) -> &'static str {
        match self {
            Value::String(_) => Encoding::String.name(),
            Value::Buffer(_) => Encoding::Buffer.name(),
            Value::Uint(_) => Encoding::Uint.name(),
            Value::Json(_) => Encoding::Json.name(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Buffer(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Buffer(Bytes::from(b))
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Buffer(b)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Uint(n)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl Encoding {
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::String => "string",
            Encoding::Buffer => "buffer",
            Encoding::Uint => "uint",
            Encoding::Json => "json",
        }
    }

    /// Encode `value`, which must match this encoding.
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        let bytes = match (self, value) {
            (Encoding::String, Value::String(s)) => postcard::to_allocvec(s.as_str())?,
            (Encoding::Buffer, Value::Buffer(b)) => postcard::to_allocvec(b.as_ref())?,
            (Encoding::Uint, Value::Uint(n)) => postcard::to_allocvec(n)?,
            (Encoding::Json, Value::Json(v)) => serde_json::to_vec(v)?,
            _ => {
                return Err(Error::EncodingMismatch {
                    expected: self.name(),
                    actual: value.kind(),
                })
            }
        };
        Ok(bytes)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Value> {
        let value = match self {
            Encoding::String => Value::String(postcard::from_bytes::<String>(bytes)?),
            Encoding::Buffer => Value::Buffer(Bytes::from(postcard::from_bytes::<Vec<u8>>(bytes)?)),
            Encoding::Uint => Value::Uint(postcard::from_bytes::<u64>(bytes)?),
            Encoding::Json => Value::Json(serde_json::from_slice(bytes)?),
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_is_varint_prefixed() {
        let bytes = Encoding::String.encode(&Value::from("foo")).unwrap();
        assert_eq!(bytes, vec![3, b'f', b'o', b'o']);
        assert_eq!(Encoding::String.decode(&bytes).unwrap(), Value::from("foo"));
    }

    #[test]
    fn test_buffer_matches_string_layout() {
        let bytes = Encoding::Buffer.encode(&Value::from(vec![9u8, 8, 7])).unwrap();
        assert_eq!(bytes, vec![3, 9, 8, 7]);
        assert_eq!(
            Encoding::Buffer.decode(&bytes).unwrap().as_bytes().unwrap().as_ref(),
            &[9, 8, 7]
        );
    }

    #[test]
    fn test_uint_varint() {
        let bytes = Encoding::Uint.encode(&Value::Uint(300)).unwrap();
        assert_eq!(bytes, vec![0xac, 0x02]);
        assert_eq!(Encoding::Uint.decode(&bytes).unwrap().as_u64(), Some(300));
    }

    #[test]
    fn test_json_document() {
        let doc = serde_json::json!({ "name": "alice" });
        let bytes = Encoding::Json.encode(&Value::from(doc.clone())).unwrap();
        assert_eq!(Encoding::Json.decode(&bytes).unwrap().as_json(), Some(&doc));
    }

    #[test]
    fn test_mismatch_rejected() {
        let result = Encoding::Uint.encode(&Value::from("nope"));
        assert!(matches!(
            result,
            Err(Error::EncodingMismatch {
                expected: "uint",
                actual: "string"
            })
        ));
    }

    #[test]
    fn test_truncated_string_fails() {
        assert!(Encoding::String.decode(&[5, b'a']).is_err());
    }
}
