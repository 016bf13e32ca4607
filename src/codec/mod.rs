//! Codec module - payload serialization strategies.
//!
//! The connection engine never inspects payload bytes; it only moves them
//! through [`PayloadCodec`]. The codec is picked per connection at
//! construction time and must match on both peers — it is never negotiated
//! on the wire.
//!
//! # Example
//!
//! ```
//! use peerwire::codec::PayloadCodec;
//!
//! let codec = PayloadCodec::Json;
//! let bytes = codec.encode(&("a", 1)).unwrap();
//! let (s, n): (String, i32) = codec.decode(&bytes).unwrap();
//! assert_eq!((s.as_str(), n), ("a", 1));
//! ```

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

use crate::error::Result;

/// Payload encoding used by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadCodec {
    /// JSON via `serde_json` (default).
    #[default]
    Json,
    /// MessagePack via `rmp-serde`.
    MsgPack,
}

impl PayloadCodec {
    /// Encode a value with this codec.
    pub fn encode<T: serde::Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            PayloadCodec::Json => JsonCodec::encode(value),
            PayloadCodec::MsgPack => MsgPackCodec::encode(value),
        }
    }

    /// Decode a value with this codec.
    pub fn decode<T: serde::de::DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            PayloadCodec::Json => JsonCodec::decode(bytes),
            PayloadCodec::MsgPack => MsgPackCodec::decode(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codecs_roundtrip_identically() {
        for codec in [PayloadCodec::Json, PayloadCodec::MsgPack] {
            let encoded = codec.encode(&(1u32, "two")).unwrap();
            let (n, s): (u32, String) = codec.decode(&encoded).unwrap();
            assert_eq!(n, 1);
            assert_eq!(s, "two");
        }
    }

    #[test]
    fn test_codecs_are_not_interchangeable() {
        let encoded = PayloadCodec::Json.encode(&vec![1, 2, 3]).unwrap();
        let result: Result<Vec<i32>> = PayloadCodec::MsgPack.decode(&encoded);
        assert!(result.is_err());
    }
}
