//! Wire format encoding and decoding.
//!
//! Every transport buffer travels on the byte stream behind a 7-byte header:
//! ```text
//! ┌────────────┬───────┬──────────────┐
//! │ Channel ID │ Flags │ Payload len  │
//! │ 2 bytes    │ 1 byte│ 4 bytes      │
//! │ int16 BE   │       │ uint32 BE    │
//! └────────────┴───────┴──────────────┘
//! ```
//!
//! The payload of a buffer starts with the signal header
//! (`[correlation_id: i32]`, plus `[signal_id: i16]` on the first buffer of
//! an actor-initiated exchange). All multi-byte integers are Big Endian.

use crate::error::{Result, SignalError};

/// Header size in bytes (fixed, exactly 7).
pub const HEADER_SIZE: usize = 7;

/// Default buffer capacity (signal header + payload).
pub const DEFAULT_BUFFER_CAPACITY: usize = 4096;

/// Default maximum payload size of a single buffer (1 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 1_048_576;

/// Flag constants for buffer headers.
pub mod flags {
    /// Last buffer of a signal stream phase.
    pub const EOS: u8 = 0b0000_0001;
    /// The sender closed this channel.
    pub const CLOSE_CHANNEL: u8 = 0b0000_0010;

    /// Reserved bits mask (bits 2-7).
    pub const RESERVED_MASK: u8 = 0b1111_1100;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// Decoded buffer header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Channel the buffer belongs to.
    pub channel_id: i16,
    /// Flags byte (see `flags` module).
    pub flags: u8,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(channel_id: i16, flags: u8, payload_length: u32) -> Self {
        Self {
            channel_id,
            flags,
            payload_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use signalwire::buffer::{flags, Header};
    ///
    /// let bytes = Header::new(3, flags::EOS, 100).encode();
    /// assert_eq!(bytes, [0, 3, 1, 0, 0, 0, 100]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.channel_id.to_be_bytes());
        buf[2] = self.flags;
        buf[3..7].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            channel_id: i16::from_be_bytes([buf[0], buf[1]]),
            flags: buf[2],
            payload_length: u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]),
        })
    }

    /// Validate the header: payload within bounds, reserved flag bits clear.
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.payload_length > max_payload_size {
            return Err(SignalError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }

        if self.flags & flags::RESERVED_MASK != 0 {
            return Err(SignalError::Protocol(
                "Reserved flag bits must be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Check if this buffer ends a signal stream phase.
    #[inline]
    pub fn is_eos(&self) -> bool {
        flags::has_flag(self.flags, flags::EOS)
    }

    /// Check if this buffer announces a channel close.
    #[inline]
    pub fn is_close(&self) -> bool {
        flags::has_flag(self.flags, flags::CLOSE_CHANNEL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode() {
        let original = Header::new(-7, flags::EOS, 4096);
        let decoded = Header::decode(&original.encode()).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_big_endian_byte_order() {
        let bytes = Header::new(0x0102, 0x01, 0x04050607).encode();
        assert_eq!(bytes, [0x01, 0x02, 0x01, 0x04, 0x05, 0x06, 0x07]);
    }

    #[test]
    fn test_negative_channel_id() {
        let bytes = Header::new(-1, 0, 0).encode();
        assert_eq!(&bytes[0..2], &[0xFF, 0xFF]);
        assert_eq!(Header::decode(&bytes).unwrap().channel_id, -1);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        assert!(Header::decode(&[0u8; HEADER_SIZE - 1]).is_none());
    }

    #[test]
    fn test_validate_payload_too_large() {
        let result = Header::new(1, 0, 1_000).validate(100);
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_validate_reserved_bits() {
        let result = Header::new(1, 0b1000_0000, 0).validate(DEFAULT_MAX_PAYLOAD_SIZE);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Reserved flag bits"));

        let ok = Header::new(1, flags::EOS | flags::CLOSE_CHANNEL, 0);
        assert!(ok.validate(DEFAULT_MAX_PAYLOAD_SIZE).is_ok());
    }

    #[test]
    fn test_flag_accessors() {
        let eos = Header::new(1, flags::EOS, 0);
        assert!(eos.is_eos());
        assert!(!eos.is_close());

        let close = Header::new(1, flags::CLOSE_CHANNEL, 0);
        assert!(close.is_close());
        assert!(!close.is_eos());
    }
}
