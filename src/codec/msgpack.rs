//! MsgPack codec using `rmp-serde`.
//!
//! Structs are always encoded with `to_vec_named`, as maps keyed by field
//! name. Positional arrays (`to_vec`) would tie the wire format to field
//! order, so adding a field to an [`ErrorDetail`](crate::error::ErrorDetail)
//! or a user value would break peers built from older code.
//!
//! # Example
//!
//! ```
//! use signalwire::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Progress {
//!     total: f64,
//!     done: f64,
//! }
//!
//! let value = Progress { total: 100.0, done: 42.0 };
//! let encoded = MsgPackCodec::encode(&value).unwrap();
//! let decoded: Progress = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, value);
//! ```

use crate::error::Result;

/// MessagePack codec for structured values.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (structs as maps).
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
