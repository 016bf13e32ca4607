//! Protocol module - wire format, framing, and resynchronization.
//!
//! - 16-byte header encoding/decoding with a configurable byte order
//! - Frame struct with typed flag accessors
//! - Frame buffer that accumulates partial reads and resyncs on noise

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::Frame;
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    flags, ByteOrder, Header, DEFAULT_MAX_BODY_SIZE, HEADER_BYTE, HEADER_SIZE, TAIL_BYTE,
};
