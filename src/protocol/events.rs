//! Protocol notifications.

use std::time::Duration;

use crate::signal::Signal;

/// Capacity of the event channel. Slow subscribers miss older events.
pub(crate) const EVENT_CAPACITY: usize = 256;

/// Notification published by a [`SignalProtocol`](super::SignalProtocol).
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// An exchange was registered in the in-flight table.
    SignalScheduled {
        /// The exchange.
        signal: Signal,
    },
    /// An exchange completed and left the in-flight table.
    SignalFinished {
        /// The exchange.
        signal: Signal,
        /// Display text of the failure, if it failed.
        error: Option<String>,
    },
    /// The timeout was changed by the peer or locally.
    TimeoutChanged {
        /// Previous timeout.
        old: Option<Duration>,
        /// New timeout.
        new: Option<Duration>,
    },
}
