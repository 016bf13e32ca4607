//! Wire format encoding and decoding.
//!
//! Implements the 16-byte header format:
//! ```text
//! ┌──────┬──────┬────────────┬─────────────┬────────────┬───────────┬──────┐
//! │ 0x09 │ Flag │ Request ID │ Response ID │ Body Len   │ Name Len  │ 0x12 │
//! │ 1 B  │ 1 B  │ uint32     │ uint32      │ uint32     │ 1 B       │ 1 B  │
//! └──────┴──────┴────────────┴─────────────┴────────────┴───────────┴──────┘
//! ```
//!
//! Multi-byte integers use the connection-wide [`ByteOrder`]; both peers must
//! be configured identically. The leading and trailing sentinel bytes carry no
//! integrity guarantee — they exist so the decoder can resynchronize on a
//! corrupted stream.

use crate::error::{Result, RpcError};

/// First byte of every header.
pub const HEADER_BYTE: u8 = 0x09;

/// Last byte of every header.
pub const TAIL_BYTE: u8 = 0x12;

/// Header size in bytes (fixed, exactly 16).
pub const HEADER_SIZE: usize = 16;

/// Default maximum frame body size (method name + content, 1 GB).
pub const DEFAULT_MAX_BODY_SIZE: u32 = 1_073_741_824;

/// Byte order for the multi-byte header fields.
///
/// Chosen per connection; never negotiated on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

impl ByteOrder {
    #[inline]
    pub fn put_u32(&self, buf: &mut [u8], value: u32) {
        let bytes = match self {
            ByteOrder::Big => value.to_be_bytes(),
            ByteOrder::Little => value.to_le_bytes(),
        };
        buf[..4].copy_from_slice(&bytes);
    }

    #[inline]
    pub fn get_u32(&self, buf: &[u8]) -> u32 {
        let bytes = [buf[0], buf[1], buf[2], buf[3]];
        match self {
            ByteOrder::Big => u32::from_be_bytes(bytes),
            ByteOrder::Little => u32::from_le_bytes(bytes),
        }
    }
}

/// Flag constants for the protocol.
pub mod flags {
    /// Bits 0-1: transform type.
    pub const TRANSFORM_MASK: u8 = 0b0000_0011;
    /// Transform type: ordinary request/response traffic.
    pub const TRANSFORM_NORMAL: u8 = 0;
    /// Transform type: keepalive probe.
    pub const TRANSFORM_KEEPALIVE: u8 = 1;

    /// Bit 2: the body is an error message.
    pub const IS_ERROR: u8 = 0b0000_0100;
    /// Bit 3: the sender expects a response frame.
    pub const NEEDS_RESPONSE: u8 = 0b0000_1000;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flag: u8, bit: u8) -> bool {
        flag & bit != 0
    }
}

/// Decoded header fields.
///
/// `content_length` and `method_name_len` describe how many body bytes follow
/// the header on the wire; the encoder derives them from the actual slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub flag: u8,
    pub request_frame_id: u32,
    pub response_frame_id: u32,
    pub content_length: u32,
    pub method_name_len: u8,
}

impl Header {
    /// Encode the header to its 16-byte wire form.
    pub fn encode(&self, order: ByteOrder) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = HEADER_BYTE;
        buf[1] = self.flag;
        order.put_u32(&mut buf[2..6], self.request_frame_id);
        order.put_u32(&mut buf[6..10], self.response_frame_id);
        order.put_u32(&mut buf[10..14], self.content_length);
        buf[14] = self.method_name_len;
        buf[15] = TAIL_BYTE;
        buf
    }

    /// Decode a header from a 16-byte buffer.
    ///
    /// The caller has already located the sentinel bytes; this only extracts
    /// the field values.
    pub fn decode(buf: &[u8], order: ByteOrder) -> Self {
        debug_assert!(buf.len() >= HEADER_SIZE);
        Self {
            flag: buf[1],
            request_frame_id: order.get_u32(&buf[2..6]),
            response_frame_id: order.get_u32(&buf[6..10]),
            content_length: order.get_u32(&buf[10..14]),
            method_name_len: buf[14],
        }
    }

    /// Total number of body bytes that follow this header on the wire.
    #[inline]
    pub fn body_len(&self) -> usize {
        self.method_name_len as usize + self.content_length as usize
    }

    /// Reject bodies above the configured limit.
    pub fn validate(&self, max_body_size: u32) -> Result<()> {
        if self.content_length > max_body_size {
            return Err(RpcError::Protocol(format!(
                "content length {} exceeds maximum {}",
                self.content_length, max_body_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Header {
        Header {
            flag: flags::NEEDS_RESPONSE,
            request_frame_id: 0x04050607,
            response_frame_id: 0,
            content_length: 0x08090A0B,
            method_name_len: 12,
        }
    }

    #[test]
    fn test_encode_decode_roundtrip_big_endian() {
        let original = sample();
        let encoded = original.encode(ByteOrder::Big);
        let decoded = Header::decode(&encoded, ByteOrder::Big);
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_encode_decode_roundtrip_little_endian() {
        let original = sample();
        let encoded = original.encode(ByteOrder::Little);
        let decoded = Header::decode(&encoded, ByteOrder::Little);
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_sentinel_bytes_present() {
        let encoded = sample().encode(ByteOrder::Big);
        assert_eq!(encoded[0], HEADER_BYTE);
        assert_eq!(encoded[HEADER_SIZE - 1], TAIL_BYTE);
    }

    #[test]
    fn test_big_endian_field_layout() {
        let encoded = sample().encode(ByteOrder::Big);

        assert_eq!(encoded[1], flags::NEEDS_RESPONSE);
        // request id 0x04050607
        assert_eq!(&encoded[2..6], &[0x04, 0x05, 0x06, 0x07]);
        // response id 0
        assert_eq!(&encoded[6..10], &[0, 0, 0, 0]);
        // content length 0x08090A0B
        assert_eq!(&encoded[10..14], &[0x08, 0x09, 0x0A, 0x0B]);
        assert_eq!(encoded[14], 12);
    }

    #[test]
    fn test_byte_orders_disagree() {
        let encoded = sample().encode(ByteOrder::Big);
        let decoded = Header::decode(&encoded, ByteOrder::Little);
        assert_ne!(decoded.request_frame_id, sample().request_frame_id);
    }

    #[test]
    fn test_header_size_is_exactly_16() {
        assert_eq!(HEADER_SIZE, 16);
        assert_eq!(sample().encode(ByteOrder::Big).len(), 16);
    }

    #[test]
    fn test_body_len_sums_name_and_content() {
        let header = Header {
            flag: 0,
            request_frame_id: 1,
            response_frame_id: 0,
            content_length: 100,
            method_name_len: 11,
        };
        assert_eq!(header.body_len(), 111);
    }

    #[test]
    fn test_validate_oversized_body() {
        let mut header = sample();
        header.content_length = 1_000;
        let result = header.validate(100);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }
}
