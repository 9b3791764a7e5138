//! In-flight table entries and correlation ID allocation.

use crate::io::InboundSender;
use crate::monitor::{Monitor, RemoteProgress};
use crate::signal::Signal;

/// Allocates correlation IDs for locally initiated exchanges.
///
/// IDs run from 1 to `i32::MAX` and then wrap back to 1. Zero and negative
/// values are never handed out; they belong to the peer's exchanges.
#[derive(Debug)]
pub(crate) struct CorrelationIdAllocator {
    next: i32,
}

impl CorrelationIdAllocator {
    pub(crate) const MIN: i32 = 1;
    pub(crate) const MAX: i32 = i32::MAX;

    pub(crate) fn new() -> Self {
        Self::starting_at(Self::MIN)
    }

    pub(crate) fn starting_at(next: i32) -> Self {
        Self {
            next: next.clamp(Self::MIN, Self::MAX),
        }
    }

    pub(crate) fn next_id(&mut self) -> i32 {
        let id = self.next;
        self.next = if id == Self::MAX { Self::MIN } else { id + 1 };
        id
    }
}

/// Side-specific state of an in-flight exchange.
pub(crate) enum EntryRole {
    /// Started locally.
    Actor {
        /// Mirror of the peer's progress (monitored exchanges only).
        remote_progress: Option<RemoteProgress>,
    },
    /// Started by the peer.
    Reactor {
        /// Local progress monitor (monitored exchanges only).
        monitor: Option<Monitor>,
        /// The peer canceled before the monitor was attached.
        cancel_pending: bool,
    },
    /// Started by the peer with an unknown signal ID. Swallows the rest of
    /// the request until its last buffer.
    Refused,
}

impl EntryRole {
    pub(crate) fn actor() -> Self {
        EntryRole::Actor {
            remote_progress: None,
        }
    }

    pub(crate) fn reactor() -> Self {
        EntryRole::Reactor {
            monitor: None,
            cancel_pending: false,
        }
    }
}

/// An exchange in the in-flight table.
pub(crate) struct SignalEntry {
    pub(crate) signal: Signal,
    /// Feeds the exchange's input; `None` for one-way requests.
    pub(crate) inbound: Option<InboundSender>,
    pub(crate) role: EntryRole,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_from_one() {
        let mut ids = CorrelationIdAllocator::new();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(ids.next_id(), 3);
    }

    #[test]
    fn test_wraps_to_one() {
        let mut ids = CorrelationIdAllocator::starting_at(i32::MAX - 1);
        assert_eq!(ids.next_id(), i32::MAX - 1);
        assert_eq!(ids.next_id(), i32::MAX);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
    }

    #[test]
    fn test_never_zero_or_negative() {
        let mut ids = CorrelationIdAllocator::starting_at(-20);
        assert_eq!(ids.next_id(), 1);

        let mut ids = CorrelationIdAllocator::starting_at(i32::MAX - 1000);
        for _ in 0..2000 {
            assert!(ids.next_id() > 0);
        }
    }
}
