//! Error types for signalwire.

use std::backtrace::Backtrace;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for all signal operations.
#[derive(Debug, Error)]
pub enum SignalError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol violation (malformed buffer, bad string, reserved bits...).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No buffer arrived within the signal's timeout.
    #[error("Timeout after {0:?} while waiting for buffers")]
    Timeout(Duration),

    /// The peer failed while processing the exchange.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The signal was force-failed because its protocol was deactivated.
    #[error("Stopping signal because of deactivation: {0}")]
    Deactivated(String),

    /// No reactor is known for this signal ID.
    #[error("Invalid signal ID {0}")]
    UnknownSignal(i16),

    /// An actor was started on a protocol other than the one that created it.
    #[error("Wrong protocol: actor belongs to {0}")]
    WrongProtocol(String),

    /// The protocol is not active.
    #[error("Protocol not active: {0}")]
    NotActive(String),

    /// The protocol has no channel to write to.
    #[error("No channel for protocol {0}")]
    NoChannel(String),

    /// A progress monitor was canceled (locally, by the peer, or by timeout).
    #[error("Operation canceled: {0}")]
    Canceled(String),

    /// Requesting and confirming work shares leave a negative remote share.
    #[error("Invalid work split: requesting {requesting}% + confirming {confirming}% exceeds 100%")]
    InvalidWorkSplit {
        /// Requesting phase percentage.
        requesting: i32,
        /// Confirming phase percentage.
        confirming: i32,
    },

    /// Read past the end of a signal stream.
    #[error("Unexpected end of signal stream")]
    EndOfStream,

    /// Connection or signal stream closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write buffer full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

impl SignalError {
    /// Short machine-readable kind, used for structured remote errors.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalError::Io(_) => "io",
            SignalError::Json(_) => "json",
            SignalError::MsgPackEncode(_) => "msgpack_encode",
            SignalError::MsgPackDecode(_) => "msgpack_decode",
            SignalError::Protocol(_) => "protocol",
            SignalError::Timeout(_) => "timeout",
            SignalError::Remote(_) => "remote",
            SignalError::Deactivated(_) => "deactivated",
            SignalError::UnknownSignal(_) => "unknown_signal",
            SignalError::WrongProtocol(_) => "wrong_protocol",
            SignalError::NotActive(_) => "not_active",
            SignalError::NoChannel(_) => "no_channel",
            SignalError::Canceled(_) => "canceled",
            SignalError::InvalidWorkSplit { .. } => "invalid_work_split",
            SignalError::EndOfStream => "end_of_stream",
            SignalError::ConnectionClosed => "connection_closed",
            SignalError::BackpressureTimeout => "backpressure_timeout",
        }
    }

    /// Check if this is a local timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SignalError::Timeout(_))
    }

    /// Get the remote error, if the peer failed.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            SignalError::Remote(remote) => Some(remote),
            _ => None,
        }
    }
}

/// Structured description of a failure, sent across the wire instead of a
/// serialized exception object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Error kind (see [`SignalError::kind`]).
    pub kind: String,
    /// Display text of the error.
    pub message: String,
    /// Display text of each `source()` in the chain, outermost first.
    pub causes: Vec<String>,
}

impl ErrorDetail {
    /// Kind used when a received detail cannot be decoded.
    pub const UNKNOWN_KIND: &'static str = "unknown";

    /// Capture the detail of a local error.
    pub fn from_error(error: &SignalError) -> Self {
        let mut causes = Vec::new();
        let mut source = std::error::Error::source(error);
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }

        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
            causes,
        }
    }

    /// Generic substitute for a detail that could not be decoded.
    pub fn unknown(message: &str) -> Self {
        Self {
            kind: Self::UNKNOWN_KIND.to_string(),
            message: message.to_string(),
            causes: Vec::new(),
        }
    }
}

/// Failure reported by the peer through the remote-exception control signal.
#[derive(Debug)]
pub struct RemoteError {
    while_responding: bool,
    message: String,
    detail: Option<ErrorDetail>,
    local_backtrace: Backtrace,
}

impl RemoteError {
    /// Create a remote error, capturing the local call stack.
    pub fn new(while_responding: bool, message: String, detail: Option<ErrorDetail>) -> Self {
        Self {
            while_responding,
            message,
            detail,
            local_backtrace: Backtrace::capture(),
        }
    }

    /// `true` if the peer failed while producing its response,
    /// `false` if it failed while consuming the request.
    pub fn while_responding(&self) -> bool {
        self.while_responding
    }

    /// Message sent by the peer.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Structured detail sent by the peer, if any.
    pub fn detail(&self) -> Option<&ErrorDetail> {
        self.detail.as_ref()
    }

    /// Local call stack captured when the failure was delivered.
    pub fn local_backtrace(&self) -> &Backtrace {
        &self.local_backtrace
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = if self.while_responding {
            "responding"
        } else {
            "indicating"
        };
        write!(f, "Remote failure while {}: {}", phase, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// Result type alias using SignalError.
pub type Result<T> = std::result::Result<T, SignalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detail_from_error() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        let error = SignalError::from(io);
        let detail = ErrorDetail::from_error(&error);

        assert_eq!(detail.kind, "io");
        assert!(detail.message.contains("pipe gone"));
        assert_eq!(detail.causes, vec!["pipe gone".to_string()]);
    }

    #[test]
    fn test_remote_error_display() {
        let remote = RemoteError::new(true, "boom".to_string(), None);
        assert_eq!(remote.to_string(), "Remote failure while responding: boom");

        let remote = RemoteError::new(false, "bad input".to_string(), None);
        assert_eq!(
            remote.to_string(),
            "Remote failure while indicating: bad input"
        );
    }

    #[test]
    fn test_as_remote() {
        let error = SignalError::from(RemoteError::new(false, "x".to_string(), None));
        assert!(error.as_remote().is_some());
        assert!(!error.as_remote().unwrap().while_responding());
        assert!(SignalError::Timeout(Duration::from_secs(1)).is_timeout());
        assert!(SignalError::EndOfStream.as_remote().is_none());
    }
}
