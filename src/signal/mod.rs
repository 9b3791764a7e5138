//! Signals - the logical exchanges multiplexed over a protocol.
//!
//! The requesting side implements one of the sender traits and sends it
//! through an actor; the receiving side registers reactors by signal ID.
//!
//! | | one-way | two-way | two-way, monitored |
//! |---|---|---|---|
//! | sender | [`Request`] | [`RequestWithConfirmation`] | [`RequestWithMonitoring`] |
//! | receiver | [`Indication`] | [`IndicationWithResponse`] | [`IndicationWithMonitoring`] |
//!
//! # Example
//!
//! ```
//! use signalwire::io::{SignalInput, SignalOutput};
//! use signalwire::signal::{IndicationWithResponse, RequestWithConfirmation};
//! use signalwire::{BoxFuture, Result};
//!
//! const UPPERCASE: i16 = 1;
//!
//! struct Uppercase(String);
//!
//! impl RequestWithConfirmation for Uppercase {
//!     type Output = String;
//!
//!     fn signal_id(&self) -> i16 {
//!         UPPERCASE
//!     }
//!
//!     fn requesting<'a>(&'a mut self, out: &'a mut SignalOutput) -> BoxFuture<'a, Result<()>> {
//!         Box::pin(async move {
//!             out.write_string(&self.0);
//!             Ok(())
//!         })
//!     }
//!
//!     fn confirming<'a>(&'a mut self, input: &'a mut SignalInput) -> BoxFuture<'a, Result<String>> {
//!         Box::pin(async move { input.read_string().await })
//!     }
//! }
//!
//! #[derive(Default)]
//! struct UppercaseIndication(String);
//!
//! impl IndicationWithResponse for UppercaseIndication {
//!     fn indicating<'a>(&'a mut self, input: &'a mut SignalInput) -> BoxFuture<'a, Result<()>> {
//!         Box::pin(async move {
//!             self.0 = input.read_string().await?.to_uppercase();
//!             Ok(())
//!         })
//!     }
//!
//!     fn responding<'a>(&'a mut self, out: &'a mut SignalOutput) -> BoxFuture<'a, Result<()>> {
//!         Box::pin(async move {
//!             out.write_string(&self.0);
//!             Ok(())
//!         })
//!     }
//! }
//! ```

mod actor;
pub(crate) mod reactor;
mod registry;

use crate::error::Result;
use crate::io::{SignalInput, SignalOutput};
use crate::monitor::Monitor;
use crate::BoxFuture;

pub use actor::{ConfirmationActor, MonitoringActor, RequestActor};
pub(crate) use actor::ActorCore;
pub use registry::{SignalReactorFactory, SignalRegistry};

/// Control signal: failure of the peer while handling an exchange.
pub const SIGNAL_REMOTE_EXCEPTION: i16 = -1;

/// Control signal: the requester canceled a monitored exchange.
pub const SIGNAL_MONITOR_CANCELED: i16 = -2;

/// Control signal: progress of a monitored exchange.
pub const SIGNAL_MONITOR_PROGRESS: i16 = -3;

/// Control signal: the peer changed its timeout.
pub const SIGNAL_SET_TIMEOUT: i16 = -4;

/// Check if `signal_id` is reserved for a control signal.
pub fn is_control_signal(signal_id: i16) -> bool {
    (SIGNAL_SET_TIMEOUT..=SIGNAL_REMOTE_EXCEPTION).contains(&signal_id)
}

/// Identity of one exchange, as seen by one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal {
    /// Signal type ID.
    pub id: i16,
    /// Key of the exchange in the in-flight table. Positive on the
    /// requesting side, the negated peer value on the receiving side.
    pub correlation_id: i32,
    /// Diagnostic name.
    pub name: &'static str,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.name, self.correlation_id)
    }
}

/// One-way signal sent by the requesting side.
pub trait Request: Send + 'static {
    /// Signal type ID the peer resolves its reactor with.
    fn signal_id(&self) -> i16;

    /// Diagnostic name.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Write the request.
    fn requesting<'a>(&'a mut self, out: &'a mut SignalOutput) -> BoxFuture<'a, Result<()>>;
}

/// Two-way signal: write a request, then read the confirmation.
pub trait RequestWithConfirmation: Send + 'static {
    /// Result of the exchange.
    type Output: Send + 'static;

    /// Signal type ID the peer resolves its reactor with.
    fn signal_id(&self) -> i16;

    /// Diagnostic name.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Write the request.
    fn requesting<'a>(&'a mut self, out: &'a mut SignalOutput) -> BoxFuture<'a, Result<()>>;

    /// Read the confirmation.
    fn confirming<'a>(
        &'a mut self,
        input: &'a mut SignalInput,
    ) -> BoxFuture<'a, Result<Self::Output>>;
}

/// Two-way signal whose progress on the peer is reported back.
///
/// Of 100 work units, `requesting_work_percent` cover writing the request,
/// `confirming_work_percent` reading the confirmation, and the rest the
/// peer's work.
pub trait RequestWithMonitoring: Send + 'static {
    /// Result of the exchange.
    type Output: Send + 'static;

    /// Signal type ID the peer resolves its reactor with.
    fn signal_id(&self) -> i16;

    /// Diagnostic name.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Write the request.
    fn requesting<'a>(
        &'a mut self,
        out: &'a mut SignalOutput,
        monitor: Monitor,
    ) -> BoxFuture<'a, Result<()>>;

    /// Read the confirmation.
    fn confirming<'a>(
        &'a mut self,
        input: &'a mut SignalInput,
        monitor: Monitor,
    ) -> BoxFuture<'a, Result<Self::Output>>;

    /// Share of the request phase, in percent.
    fn requesting_work_percent(&self) -> i32 {
        25
    }

    /// Share of the confirmation phase, in percent.
    fn confirming_work_percent(&self) -> i32 {
        25
    }

    /// How often the peer reports progress.
    fn monitor_progress_seconds(&self) -> i32 {
        1
    }

    /// How long the peer's monitor may stay idle before it cancels itself.
    fn monitor_timeout_seconds(&self) -> i32 {
        10
    }
}

/// One-way signal handled by the receiving side.
pub trait Indication: Send + 'static {
    /// Diagnostic name.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Read the indication.
    fn indicating<'a>(&'a mut self, input: &'a mut SignalInput) -> BoxFuture<'a, Result<()>>;
}

/// Two-way signal handled by the receiving side.
///
/// A failure in either phase is reported to the requester before it is
/// returned locally.
pub trait IndicationWithResponse: Send + 'static {
    /// Diagnostic name.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Read the request.
    fn indicating<'a>(&'a mut self, input: &'a mut SignalInput) -> BoxFuture<'a, Result<()>>;

    /// Write the response.
    fn responding<'a>(&'a mut self, out: &'a mut SignalOutput) -> BoxFuture<'a, Result<()>>;
}

/// Two-way signal handled by the receiving side, reporting progress.
pub trait IndicationWithMonitoring: Send + 'static {
    /// Diagnostic name.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Read the request and do the work.
    fn indicating<'a>(
        &'a mut self,
        input: &'a mut SignalInput,
        monitor: Monitor,
    ) -> BoxFuture<'a, Result<()>>;

    /// Write the response.
    fn responding<'a>(
        &'a mut self,
        out: &'a mut SignalOutput,
        monitor: Monitor,
    ) -> BoxFuture<'a, Result<()>>;

    /// Share of the indicating phase, in percent.
    fn indicating_work_percent(&self) -> i32 {
        99
    }
}

/// A receiver-side signal, ready to run.
pub enum SignalReactor {
    /// One-way.
    Indication(Box<dyn Indication>),
    /// Two-way.
    WithResponse(Box<dyn IndicationWithResponse>),
    /// Two-way with progress reports.
    WithMonitoring(Box<dyn IndicationWithMonitoring>),
}

impl SignalReactor {
    /// Diagnostic name of the wrapped reactor.
    pub fn name(&self) -> &'static str {
        match self {
            SignalReactor::Indication(reactor) => reactor.name(),
            SignalReactor::WithResponse(reactor) => reactor.name(),
            SignalReactor::WithMonitoring(reactor) => reactor.name(),
        }
    }
}

impl std::fmt::Debug for SignalReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SignalReactor").field(&self.name()).finish()
    }
}
