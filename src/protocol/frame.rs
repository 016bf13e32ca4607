//! Frame struct with typed accessors.
//!
//! A frame is one discrete protocol message: header, method name, body.
//! Uses `bytes::Bytes` so the receive path can hand out slices of its read
//! buffer without copying.

use bytes::Bytes;

use super::wire_format::{flags, ByteOrder, Header, HEADER_SIZE};

/// A complete protocol frame.
///
/// A frame is a *request* iff `response_frame_id == 0`, a *response*
/// otherwise. Immutable once encoded onto the wire.
#[derive(Debug, Clone)]
pub struct Frame {
    pub flag: u8,
    /// Id assigned by the sender of this frame.
    pub request_frame_id: u32,
    /// 0 for a fresh request; otherwise the `request_frame_id` being answered.
    pub response_frame_id: u32,
    pub method_name: Bytes,
    pub body: Bytes,
}

impl Frame {
    /// Build a request frame.
    pub fn request(method_name: &str, body: Bytes, request_id: u32, needs_response: bool) -> Self {
        let mut frame = Self {
            flag: 0,
            request_frame_id: request_id,
            response_frame_id: 0,
            method_name: Bytes::copy_from_slice(method_name.as_bytes()),
            body,
        };
        frame.set_needs_response(needs_response);
        frame
    }

    /// Build the response to `request`, echoing its flag and method name.
    pub fn response(request: &Frame, body: Bytes, request_id: u32) -> Self {
        Self {
            flag: request.flag,
            request_frame_id: request_id,
            response_frame_id: request.request_frame_id,
            method_name: request.method_name.clone(),
            body,
        }
    }

    /// Build a zero-body keepalive request.
    pub fn keepalive(request_id: u32) -> Self {
        let mut frame = Self::request("", Bytes::new(), request_id, true);
        frame.set_transform_type(flags::TRANSFORM_KEEPALIVE);
        frame
    }

    /// Assemble the frame from already-split wire pieces.
    pub fn from_parts(header: Header, method_name: Bytes, body: Bytes) -> Self {
        Self {
            flag: header.flag,
            request_frame_id: header.request_frame_id,
            response_frame_id: header.response_frame_id,
            method_name,
            body,
        }
    }

    /// Transform type (bits 0-1 of the flag byte).
    #[inline]
    pub fn transform_type(&self) -> u8 {
        self.flag & flags::TRANSFORM_MASK
    }

    /// Set the transform type, leaving the other flag bits untouched.
    pub fn set_transform_type(&mut self, transform_type: u8) {
        self.flag = (self.flag & !flags::TRANSFORM_MASK) | (transform_type & flags::TRANSFORM_MASK);
    }

    #[inline]
    pub fn is_keepalive(&self) -> bool {
        self.transform_type() == flags::TRANSFORM_KEEPALIVE
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        flags::has_flag(self.flag, flags::IS_ERROR)
    }

    /// Mark the frame as an error response, replacing the body with the
    /// message text.
    pub fn set_error(&mut self, message: &str) {
        self.body = Bytes::copy_from_slice(message.as_bytes());
        self.flag |= flags::IS_ERROR;
    }

    #[inline]
    pub fn needs_response(&self) -> bool {
        flags::has_flag(self.flag, flags::NEEDS_RESPONSE)
    }

    pub fn set_needs_response(&mut self, needs_response: bool) {
        if needs_response {
            self.flag |= flags::NEEDS_RESPONSE;
        } else {
            self.flag &= !flags::NEEDS_RESPONSE;
        }
    }

    /// Whether this frame initiates a call (as opposed to answering one).
    #[inline]
    pub fn is_request(&self) -> bool {
        self.response_frame_id == 0
    }

    /// A request frame with no method name is noise; it is dropped without
    /// closing the connection. Keepalives are filtered before this check.
    #[inline]
    pub fn is_malformed(&self) -> bool {
        self.method_name.is_empty() && self.response_frame_id == 0
    }

    /// Method name as text (lossy; names are expected to be UTF-8).
    pub fn method_name_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.method_name)
    }

    fn header(&self) -> Header {
        Header {
            flag: self.flag,
            request_frame_id: self.request_frame_id,
            response_frame_id: self.response_frame_id,
            content_length: self.body.len() as u32,
            method_name_len: self.method_name.len() as u8,
        }
    }

    /// Encode the full frame: 16 header bytes, method name, body.
    pub fn encode(&self, order: ByteOrder) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.method_name.len() + self.body.len());
        buf.extend_from_slice(&self.header().encode(order));
        buf.extend_from_slice(&self.method_name);
        buf.extend_from_slice(&self.body);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame() {
        let frame = Frame::request("global_Hello", Bytes::from_static(b"body"), 42, true);

        assert_eq!(frame.request_frame_id, 42);
        assert_eq!(frame.response_frame_id, 0);
        assert!(frame.is_request());
        assert!(frame.needs_response());
        assert!(!frame.is_error());
        assert!(!frame.is_keepalive());
        assert_eq!(frame.method_name_str(), "global_Hello");
    }

    #[test]
    fn test_response_echoes_request() {
        let request = Frame::request("m_f", Bytes::from_static(b"in"), 7, true);
        let response = Frame::response(&request, Bytes::from_static(b"out"), 99);

        assert_eq!(response.response_frame_id, 7);
        assert_eq!(response.request_frame_id, 99);
        assert_eq!(response.method_name, request.method_name);
        assert!(!response.is_request());
    }

    #[test]
    fn test_keepalive_frame() {
        let frame = Frame::keepalive(5);

        assert!(frame.is_keepalive());
        assert!(frame.needs_response());
        assert!(frame.method_name.is_empty());
        assert!(frame.body.is_empty());
    }

    #[test]
    fn test_transform_type_preserves_other_bits() {
        let mut frame = Frame::request("a_b", Bytes::new(), 1, true);
        frame.set_transform_type(flags::TRANSFORM_KEEPALIVE);

        assert!(frame.is_keepalive());
        assert!(frame.needs_response());

        frame.set_transform_type(flags::TRANSFORM_NORMAL);
        assert!(!frame.is_keepalive());
        assert!(frame.needs_response());
    }

    #[test]
    fn test_set_error_replaces_body() {
        let request = Frame::request("a_b", Bytes::new(), 1, true);
        let mut response = Frame::response(&request, Bytes::new(), 2);
        response.set_error("boom");

        assert!(response.is_error());
        assert_eq!(&response.body[..], b"boom");
    }

    #[test]
    fn test_malformed_detection() {
        let noise = Frame::request("", Bytes::new(), 1, false);
        assert!(noise.is_malformed());

        let request = Frame::request("a_b", Bytes::new(), 1, true);
        assert!(!request.is_malformed());

        // A response with an empty name is fine.
        let response = Frame::response(&request, Bytes::new(), 2);
        assert!(!response.is_malformed());
    }

    #[test]
    fn test_encode_layout() {
        let frame = Frame::request("ab_c", Bytes::from_static(b"xyz"), 3, true);
        let bytes = frame.encode(ByteOrder::Big);

        assert_eq!(bytes.len(), HEADER_SIZE + 4 + 3);
        assert_eq!(&bytes[HEADER_SIZE..HEADER_SIZE + 4], b"ab_c");
        assert_eq!(&bytes[HEADER_SIZE + 4..], b"xyz");
        assert_eq!(bytes[14], 4); // method name length
    }
}
