//! A transport buffer as it travels on the byte stream.
//!
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use signalwire::buffer::{flags, Frame, Header};
//! use bytes::Bytes;
//!
//! let frame = Frame::new(Header::new(1, flags::EOS, 5), Bytes::from_static(b"hello"));
//! assert_eq!(frame.channel_id(), 1);
//! assert!(frame.is_eos());
//! ```

use bytes::Bytes;

use super::wire_format::{Header, HEADER_SIZE};

/// A complete buffer: header plus payload.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (signal header + signal data).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Channel the buffer belongs to.
    #[inline]
    pub fn channel_id(&self) -> i16 {
        self.header.channel_id
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Check if this is the last buffer of a stream phase.
    #[inline]
    pub fn is_eos(&self) -> bool {
        self.header.is_eos()
    }

    /// Check if this frame closes its channel.
    #[inline]
    pub fn is_close(&self) -> bool {
        self.header.is_close()
    }
}

/// Build a complete frame as a single byte vector.
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::flags;

    #[test]
    fn test_frame_accessors() {
        let frame = Frame::new(
            Header::new(-3, flags::CLOSE_CHANNEL, 0),
            Bytes::new(),
        );
        assert_eq!(frame.channel_id(), -3);
        assert!(frame.is_close());
        assert!(!frame.is_eos());
        assert!(frame.payload().is_empty());
    }

    #[test]
    fn test_build_frame() {
        let header = Header::new(2, flags::EOS, 3);
        let bytes = build_frame(&header, b"abc");

        assert_eq!(bytes.len(), HEADER_SIZE + 3);
        assert_eq!(Header::decode(&bytes).unwrap(), header);
        assert_eq!(&bytes[HEADER_SIZE..], b"abc");
    }
}
