//! Signal registry for resolving reactors by signal ID.
//!
//! The registry maps application signal IDs to reactor constructors. A
//! protocol consults it for every new inbound exchange; the control signal
//! IDs are resolved by the protocol itself and cannot be registered.
//!
//! # Example
//!
//! ```ignore
//! use signalwire::signal::SignalRegistry;
//!
//! let mut registry = SignalRegistry::new();
//! registry.register_response(ECHO, EchoIndication::default)?;
//! registry.register_indication(LOG, || LogIndication::new(sink.clone()))?;
//!
//! let protocol = SignalProtocol::builder("echo").registry(registry).build();
//! ```

use std::collections::HashMap;

use super::{
    is_control_signal, Indication, IndicationWithMonitoring, IndicationWithResponse,
    SignalReactor,
};
use crate::error::{Result, SignalError};

/// Resolves signal IDs of new inbound exchanges to reactors.
pub trait SignalReactorFactory: Send + Sync + 'static {
    /// Create the reactor for `signal_id`, or `None` if it is unknown.
    fn create_signal_reactor(&self, signal_id: i16) -> Option<SignalReactor>;
}

type Constructor = Box<dyn Fn() -> SignalReactor + Send + Sync>;

/// Registry mapping signal IDs to reactor constructors.
#[derive(Default)]
pub struct SignalRegistry {
    constructors: HashMap<i16, Constructor>,
}

impl SignalRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reactor constructor.
    ///
    /// # Errors
    ///
    /// Returns error if `signal_id` is reserved for a control signal or
    /// already registered.
    pub fn register<F>(&mut self, signal_id: i16, constructor: F) -> Result<()>
    where
        F: Fn() -> SignalReactor + Send + Sync + 'static,
    {
        if is_control_signal(signal_id) {
            return Err(SignalError::Protocol(format!(
                "Signal ID {} is reserved for control signals",
                signal_id
            )));
        }
        if self.constructors.contains_key(&signal_id) {
            return Err(SignalError::Protocol(format!(
                "Signal ID {} already registered",
                signal_id
            )));
        }

        self.constructors.insert(signal_id, Box::new(constructor));
        Ok(())
    }

    /// Register a one-way reactor.
    pub fn register_indication<F, I>(&mut self, signal_id: i16, constructor: F) -> Result<()>
    where
        F: Fn() -> I + Send + Sync + 'static,
        I: Indication,
    {
        self.register(signal_id, move || SignalReactor::Indication(Box::new(constructor())))
    }

    /// Register a two-way reactor.
    pub fn register_response<F, I>(&mut self, signal_id: i16, constructor: F) -> Result<()>
    where
        F: Fn() -> I + Send + Sync + 'static,
        I: IndicationWithResponse,
    {
        self.register(signal_id, move || {
            SignalReactor::WithResponse(Box::new(constructor()))
        })
    }

    /// Register a two-way reactor that reports progress.
    pub fn register_monitored<F, I>(&mut self, signal_id: i16, constructor: F) -> Result<()>
    where
        F: Fn() -> I + Send + Sync + 'static,
        I: IndicationWithMonitoring,
    {
        self.register(signal_id, move || {
            SignalReactor::WithMonitoring(Box::new(constructor()))
        })
    }

    /// Check if a signal ID is registered.
    pub fn contains(&self, signal_id: i16) -> bool {
        self.constructors.contains_key(&signal_id)
    }

    /// Number of registered signals.
    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

impl SignalReactorFactory for SignalRegistry {
    fn create_signal_reactor(&self, signal_id: i16) -> Option<SignalReactor> {
        self.constructors.get(&signal_id).map(|constructor| constructor())
    }
}
