//! Buffer framing - wire format and frame decoding for transport buffers.
//!
//! This module implements how buffers of many channels share one byte stream:
//! - 7-byte header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    flags, Header, DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE,
};
