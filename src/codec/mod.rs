//! Codec module - serialization of structured signal values.
//!
//! [`MsgPackCodec`] encodes the values written with
//! [`SignalOutput::write_value`](crate::io::SignalOutput::write_value) and the
//! structured error detail of remote failures.
//!
//! # Example
//!
//! ```
//! use signalwire::codec::MsgPackCodec;
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;
