//! Frame buffer: accumulates partial reads and recovers frame alignment.
//!
//! Uses `bytes::BytesMut` with a two-state machine:
//! - `Scanning`: hunting for a valid 16-byte header
//! - `ReadingBody`: header parsed, waiting for name + content bytes
//!
//! The scanning state implements the resync algorithm: bytes before the first
//! `HEADER_BYTE` are discarded; a candidate window whose last byte is not
//! `TAIL_BYTE` is corrupt, and the scanner searches the window itself
//! (excluding its first byte) for another `HEADER_BYTE` to shift to, so a
//! noisy stream never forces re-reading bytes that already arrived.

use bytes::{Bytes, BytesMut};

use super::wire_format::{ByteOrder, Header, DEFAULT_MAX_BODY_SIZE, HEADER_BYTE, HEADER_SIZE, TAIL_BYTE};
use super::Frame;
use crate::error::Result;

#[derive(Debug, Clone)]
enum State {
    /// Looking for a valid header.
    Scanning,
    /// Header parsed, waiting for `header.body_len()` more bytes.
    ReadingBody { header: Header },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    order: ByteOrder,
    max_body_size: u32,
}

impl FrameBuffer {
    /// Create a frame buffer for the given byte order.
    pub fn new(order: ByteOrder) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::Scanning,
            order,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    /// Create a frame buffer with a custom body-size limit.
    pub fn with_max_body(order: ByteOrder, max_body_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::Scanning,
            order,
            max_body_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data stays buffered for the next push. Returns an error only
    /// when a header claims a body above the configured maximum; garbage and
    /// corrupt headers are skipped via the resync scan instead.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        match &self.state {
            State::Scanning => loop {
                // Discard noise in front of the first candidate byte.
                match self.buffer.iter().position(|&b| b == HEADER_BYTE) {
                    None => {
                        self.buffer.clear();
                        return Ok(None);
                    }
                    Some(0) => {}
                    Some(i) => {
                        let _ = self.buffer.split_to(i);
                    }
                }

                if self.buffer.len() < HEADER_SIZE {
                    return Ok(None);
                }

                if self.buffer[HEADER_SIZE - 1] != TAIL_BYTE {
                    // Corrupt candidate: shift to the next HEADER_BYTE inside
                    // the window, or drop the whole window if there is none.
                    let shift = self.buffer[1..HEADER_SIZE]
                        .iter()
                        .position(|&b| b == HEADER_BYTE)
                        .map(|i| i + 1)
                        .unwrap_or(HEADER_SIZE);
                    let _ = self.buffer.split_to(shift);
                    continue;
                }

                let header = Header::decode(&self.buffer[..HEADER_SIZE], self.order);
                header.validate(self.max_body_size)?;
                let _ = self.buffer.split_to(HEADER_SIZE);

                if header.body_len() == 0 {
                    return Ok(Some(Frame::from_parts(header, Bytes::new(), Bytes::new())));
                }

                self.state = State::ReadingBody { header };
                return self.try_extract_one();
            },

            State::ReadingBody { header } => {
                let header = *header;
                if self.buffer.len() < header.body_len() {
                    return Ok(None);
                }

                let mut body = self.buffer.split_to(header.body_len()).freeze();
                let method_name = body.split_to(header.method_name_len as usize);
                self.state = State::Scanning;

                Ok(Some(Frame::from_parts(header, method_name, body)))
            }
        }
    }

    /// Number of buffered bytes not yet consumed.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(method: &str, body: &[u8], request_id: u32, response_id: u32) -> Vec<u8> {
        let mut frame = Frame::request(method, Bytes::copy_from_slice(body), request_id, true);
        frame.response_frame_id = response_id;
        frame.encode(ByteOrder::Big)
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new(ByteOrder::Big);
        let frames = buffer.push(&frame_bytes("global_Hello", b"hi", 42, 0)).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].request_frame_id, 42);
        assert_eq!(frames[0].method_name_str(), "global_Hello");
        assert_eq!(&frames[0].body[..], b"hi");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new(ByteOrder::Big);
        let mut data = frame_bytes("a_b", b"1", 1, 0);
        data.extend(frame_bytes("c_d", b"2", 2, 0));
        data.extend(frame_bytes("e_f", b"3", 3, 0));

        let frames = buffer.push(&data).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].request_frame_id, 1);
        assert_eq!(frames[1].request_frame_id, 2);
        assert_eq!(frames[2].request_frame_id, 3);
    }

    #[test]
    fn test_garbage_before_header() {
        let mut buffer = FrameBuffer::new(ByteOrder::Big);
        // Garbage deliberately not header-length aligned.
        let mut data = vec![0xAA, 0xBB, 0xCC, 0xDD, 0xEE];
        data.extend(frame_bytes("a_b", b"payload", 7, 0));

        let frames = buffer.push(&data).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].request_frame_id, 7);
        assert_eq!(&frames[0].body[..], b"payload");
    }

    #[test]
    fn test_pure_garbage_is_discarded() {
        let mut buffer = FrameBuffer::new(ByteOrder::Big);
        let frames = buffer.push(&[0xAA; 64]).unwrap();
        assert!(frames.is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_resync_on_corrupt_candidate() {
        let mut buffer = FrameBuffer::new(ByteOrder::Big);
        // A lone HEADER_BYTE followed by junk forms a candidate window with a
        // bad tail; the real frame starts inside that window.
        let mut data = vec![HEADER_BYTE, 0xFF, 0xFF, 0xFF, 0xFF];
        data.extend(frame_bytes("a_b", b"ok", 9, 0));

        let frames = buffer.push(&data).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].request_frame_id, 9);
        assert_eq!(&frames[0].body[..], b"ok");
    }

    #[test]
    fn test_resync_window_without_second_header_byte() {
        let mut buffer = FrameBuffer::new(ByteOrder::Big);
        // Corrupt window containing no further HEADER_BYTE: all 16 bytes are
        // dropped, then the valid frame decodes.
        let mut data = vec![HEADER_BYTE];
        data.extend([0xFFu8; HEADER_SIZE - 1]);
        data.extend(frame_bytes("a_b", b"ok", 3, 0));

        let frames = buffer.push(&data).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].request_frame_id, 3);
    }

    #[test]
    fn test_fragmented_delivery() {
        let mut buffer = FrameBuffer::new(ByteOrder::Big);
        let data = frame_bytes("a_b", b"fragmented body", 5, 0);

        let frames = buffer.push(&data[..7]).unwrap();
        assert!(frames.is_empty());

        let frames = buffer.push(&data[7..HEADER_SIZE + 4]).unwrap();
        assert!(frames.is_empty());

        let frames = buffer.push(&data[HEADER_SIZE + 4..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].body[..], b"fragmented body");
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new(ByteOrder::Big);
        let data = frame_bytes("a_b", b"hi", 1, 0);

        let mut all = Vec::new();
        for byte in &data {
            all.extend(buffer.push(&[*byte]).unwrap());
        }
        assert_eq!(all.len(), 1);
        assert_eq!(&all[0].body[..], b"hi");
    }

    #[test]
    fn test_empty_body_frame() {
        let mut buffer = FrameBuffer::new(ByteOrder::Big);
        // Keepalives are header-only frames.
        let data = Frame::keepalive(11).encode(ByteOrder::Big);

        let frames = buffer.push(&data).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_keepalive());
        assert!(frames[0].body.is_empty());
    }

    #[test]
    fn test_little_endian_roundtrip() {
        let mut buffer = FrameBuffer::new(ByteOrder::Little);
        let frame = Frame::request("x_y", Bytes::from_static(b"le"), 0xDEADBEEF, true);
        let frames = buffer.push(&frame.encode(ByteOrder::Little)).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].request_frame_id, 0xDEADBEEF);
    }

    #[test]
    fn test_oversized_body_rejected() {
        let mut buffer = FrameBuffer::with_max_body(ByteOrder::Big, 16);
        let data = frame_bytes("a_b", &[0u8; 64], 1, 0);

        assert!(buffer.push(&data).is_err());
    }
}
