//! Signal payload I/O - typed streams over buffers.
//!
//! A signal phase writes through a [`SignalOutput`] and reads through a
//! [`SignalInput`]. Both speak the same primitive encoding:
//!
//! | Type | Encoding |
//! |------|----------|
//! | `i8`, `bool` | 1 byte |
//! | `i16`, `i32`, `i64`, `f64` | Big Endian |
//! | bytes, string | `i32` length + data (UTF-8 for strings) |
//! | optional string | length `-1` for `None` |
//! | value | MessagePack bytes, length-prefixed |
//!
//! Optional [`StreamWrapper`]s transform the raw bytes of each phase.

mod input;
mod output;
mod wrapper;

pub(crate) use input::{Inbound, InboundSender};
pub use input::SignalInput;
pub use output::SignalOutput;
pub use wrapper::{InputTransform, OutputTransform, StreamWrapper, StreamWrapperChain};

/// Size of the correlation ID that starts every buffer.
pub const SIGNAL_HEADER_SIZE: usize = 4;

/// Length prefix of an absent optional field.
const NONE_LENGTH: i32 = -1;
