//! Signal protocol - multiplexes signals over one buffer channel.
//!
//! Every buffer on the channel starts with a correlation ID. The side that
//! opens an exchange allocates a positive ID and keys it by that ID; the
//! other side keys it by the negated ID and writes the negated ID back:
//!
//! | Direction | Wire value | Local key |
//! |-----------|------------|-----------|
//! | actor writes | `c` | `c` |
//! | reactor receives | `c` | `-c` |
//! | reactor writes | `-c` | `-c` |
//! | actor receives | `-c` | `c` |
//!
//! A positive wire value with no entry opens a new exchange and is followed
//! by the signal ID. A negative wire value with no entry is a late buffer of
//! a finished exchange and is dropped.

pub(crate) mod control;
mod events;
pub(crate) mod table;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::sync::{broadcast, Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::config::{ProtocolConfig, DEFAULT_TIMEOUT};
use crate::error::{ErrorDetail, RemoteError, Result, SignalError};
use crate::io::{
    Inbound, InboundSender, SignalInput, SignalOutput, StreamWrapper, StreamWrapperChain,
    SIGNAL_HEADER_SIZE,
};
use crate::monitor::Monitor;
use crate::signal::{
    reactor, ActorCore, ConfirmationActor, MonitoringActor, Request, RequestActor,
    RequestWithConfirmation, RequestWithMonitoring, Signal, SignalReactor, SignalReactorFactory,
    SignalRegistry, SIGNAL_MONITOR_CANCELED, SIGNAL_MONITOR_PROGRESS, SIGNAL_REMOTE_EXCEPTION,
    SIGNAL_SET_TIMEOUT,
};
use crate::transport::{Channel, Connector};
use control::{
    MonitorCanceledIndication, MonitorProgressIndication, RemoteExceptionIndication,
    RemoteExceptionRequest, SetTimeoutIndication, SetTimeoutRequest,
};
use table::{CorrelationIdAllocator, EntryRole, SignalEntry};

pub use events::ProtocolEvent;

const CANCELED_BY_PEER: &str = "Canceled by the requesting side";

/// Lifecycle state of a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Not bound or already shut down. No signal can start.
    Inactive,
    /// Running.
    Active,
    /// Waiting for in-flight signals before shutting down. Signals can
    /// still start.
    Deactivating,
}

/// Builder for [`SignalProtocol`].
pub struct SignalProtocolBuilder {
    protocol_type: String,
    config: ProtocolConfig,
    factory: Option<Arc<dyn SignalReactorFactory>>,
    wrapper: Option<Arc<dyn StreamWrapper>>,
}

impl SignalProtocolBuilder {
    /// Create a builder for a protocol of the given type name.
    pub fn new(protocol_type: impl Into<String>) -> Self {
        Self {
            protocol_type: protocol_type.into(),
            config: ProtocolConfig::default(),
            factory: None,
            wrapper: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ProtocolConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the timeout for pending signal I/O (`None` = forever).
    ///
    /// Default: 10 seconds
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set how long deactivation waits for in-flight signals.
    ///
    /// Default: 10 seconds
    pub fn deactivation_grace(mut self, grace: Duration) -> Self {
        self.config.deactivation_grace = grace;
        self
    }

    /// Set the maximum number of reactors executing at once. Further
    /// reactors wait for a free slot.
    ///
    /// Default: 256
    pub fn max_concurrent_signals(mut self, limit: usize) -> Self {
        self.config.max_concurrent_signals = limit;
        self
    }

    /// Push local timeout changes to the peer.
    ///
    /// Default: true
    pub fn send_timeout_changes(mut self, send: bool) -> Self {
        self.config.send_timeout_changes = send;
        self
    }

    /// Resolve incoming signal IDs with `factory`.
    pub fn factory<F: SignalReactorFactory>(mut self, factory: F) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Resolve incoming signal IDs with `registry`.
    pub fn registry(self, registry: SignalRegistry) -> Self {
        self.factory(registry)
    }

    /// Transform the data of every signal phase.
    pub fn stream_wrapper<W: StreamWrapper>(mut self, wrapper: W) -> Self {
        self.wrapper = Some(Arc::new(wrapper));
        self
    }

    /// Build the protocol. It stays inactive until bound to a channel.
    pub fn build(self) -> SignalProtocol {
        let timeout = self.config.timeout;
        let permits = self.config.max_concurrent_signals.max(1);
        let (events, _) = broadcast::channel(events::EVENT_CAPACITY);

        SignalProtocol {
            inner: Arc::new(ProtocolInner {
                protocol_type: self.protocol_type,
                config: self.config,
                timeout: Mutex::new(timeout),
                factory: self.factory,
                wrapper: Mutex::new(self.wrapper),
                correlation_ids: Mutex::new(CorrelationIdAllocator::new()),
                signals: Mutex::new(HashMap::new()),
                drained: Notify::new(),
                deactivated: Notify::new(),
                channel: Mutex::new(None),
                state: Mutex::new(ProtocolState::Inactive),
                failing_over: AtomicBool::new(false),
                events,
                permits: Arc::new(Semaphore::new(permits)),
            }),
        }
    }
}

/// Multiplexes concurrent signals over one channel. Cheap to clone.
#[derive(Clone)]
pub struct SignalProtocol {
    inner: Arc<ProtocolInner>,
}

struct ProtocolInner {
    protocol_type: String,
    config: ProtocolConfig,
    timeout: Mutex<Option<Duration>>,
    factory: Option<Arc<dyn SignalReactorFactory>>,
    wrapper: Mutex<Option<Arc<dyn StreamWrapper>>>,
    correlation_ids: Mutex<CorrelationIdAllocator>,
    signals: Mutex<HashMap<i32, SignalEntry>>,
    /// Notified whenever an entry leaves the in-flight table.
    drained: Notify,
    /// Notified once deactivation completes.
    deactivated: Notify,
    channel: Mutex<Option<Arc<dyn Channel>>>,
    state: Mutex<ProtocolState>,
    failing_over: AtomicBool,
    events: broadcast::Sender<ProtocolEvent>,
    permits: Arc<Semaphore>,
}

impl SignalProtocol {
    /// Create a protocol builder.
    pub fn builder(protocol_type: impl Into<String>) -> SignalProtocolBuilder {
        SignalProtocolBuilder::new(protocol_type)
    }

    /// Type name of this protocol.
    pub fn protocol_type(&self) -> &str {
        &self.inner.protocol_type
    }

    /// Configuration the protocol was built with.
    pub fn config(&self) -> &ProtocolConfig {
        &self.inner.config
    }

    /// Current timeout for pending signal I/O (`None` = forever).
    pub fn timeout(&self) -> Option<Duration> {
        *lock(&self.inner.timeout)
    }

    /// Change the timeout. If it changed and the protocol is active, the new
    /// value is pushed to the peer.
    pub async fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        if self.update_timeout(timeout) && self.is_active() && self.inner.config.send_timeout_changes
        {
            self.push_timeout().await?;
        }
        Ok(())
    }

    /// Add a stream wrapper on top of the current one.
    pub fn add_stream_wrapper<W: StreamWrapper>(&self, wrapper: W) {
        let mut current = lock(&self.inner.wrapper);
        let outer: Arc<dyn StreamWrapper> = Arc::new(wrapper);
        *current = Some(match current.take() {
            Some(inner) => Arc::new(StreamWrapperChain::new(outer, inner)),
            None => outer,
        });
    }

    /// Replace the stream wrapper (`None` removes it).
    pub fn set_stream_wrapper(&self, wrapper: Option<Arc<dyn StreamWrapper>>) {
        *lock(&self.inner.wrapper) = wrapper;
    }

    /// Current stream wrapper.
    pub fn stream_wrapper(&self) -> Option<Arc<dyn StreamWrapper>> {
        lock(&self.inner.wrapper).clone()
    }

    /// Subscribe to protocol events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.inner.events.subscribe()
    }

    /// Open a channel on `connector`, bind it and activate.
    pub async fn open(&self, connector: &Connector) -> Result<()> {
        connector.open_channel(self).await
    }

    /// Deactivate the protocol and close its channel.
    pub async fn close(&self) {
        self.deactivate().await;
    }

    /// Lifecycle state.
    pub fn state(&self) -> ProtocolState {
        *lock(&self.inner.state)
    }

    /// `true` unless the protocol is inactive.
    pub fn is_active(&self) -> bool {
        self.state() != ProtocolState::Inactive
    }

    /// Activate the bound channel and push a non-default timeout to the
    /// peer.
    pub async fn activate(&self) -> Result<()> {
        self.start()?;
        self.after_activate().await
    }

    /// Wait up to the deactivation grace for in-flight signals, fail the
    /// rest with [`SignalError::Deactivated`] and close the channel.
    ///
    /// Concurrent callers all return once the protocol is inactive.
    pub async fn deactivate(&self) {
        let deactivated = self.inner.deactivated.notified();
        tokio::pin!(deactivated);
        deactivated.as_mut().enable();

        let in_progress = {
            let mut state = lock(&self.inner.state);
            match *state {
                ProtocolState::Inactive => return,
                ProtocolState::Deactivating => true,
                ProtocolState::Active => {
                    *state = ProtocolState::Deactivating;
                    false
                }
            }
        };
        if in_progress {
            deactivated.await;
            return;
        }
        tracing::debug!("Deactivating protocol {}", self.inner.protocol_type);

        self.wait_for_signals(self.inner.config.deactivation_grace).await;
        self.finish_deactivation();
    }

    /// Keep the protocol active when its channel goes away, so it can be
    /// bound to a new one.
    pub fn set_failing_over(&self, failing_over: bool) {
        self.inner.failing_over.store(failing_over, Ordering::Release);
    }

    /// Check if channel loss is currently ignored.
    pub fn is_failing_over(&self) -> bool {
        self.inner.failing_over.load(Ordering::Acquire)
    }

    /// Called when the channel went away. Deactivates in the background
    /// unless failing over.
    pub fn handle_channel_deactivation(&self) {
        if self.is_failing_over() {
            tracing::debug!(
                "Channel of {} lost while failing over",
                self.inner.protocol_type
            );
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let protocol = self.clone();
                runtime.spawn(async move { protocol.deactivate().await });
            }
            Err(_) => tracing::warn!(
                "Channel of {} lost outside a runtime, not deactivating",
                self.inner.protocol_type
            ),
        }
    }

    /// Wait until no signal is in flight. Returns `false` on timeout.
    pub async fn wait_for_signals(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if lock(&self.inner.signals).is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                return lock(&self.inner.signals).is_empty();
            }
        }
    }

    /// Number of signals in flight.
    pub fn in_flight(&self) -> usize {
        lock(&self.inner.signals).len()
    }

    /// Allocate the next correlation ID for a locally started signal.
    pub fn next_correlation_id(&self) -> i32 {
        lock(&self.inner.correlation_ids).next_id()
    }

    /// Route one buffer received on the channel.
    pub fn handle_buffer(&self, payload: Bytes, eos: bool) {
        if self.state() == ProtocolState::Inactive {
            tracing::warn!(
                "Discarding buffer for inactive protocol {}",
                self.inner.protocol_type
            );
            return;
        }
        if payload.len() < SIGNAL_HEADER_SIZE {
            tracing::warn!("Discarding buffer without signal header ({} bytes)", payload.len());
            return;
        }

        let mut payload = payload;
        let wire = payload.get_i32();
        let key = match wire.checked_neg() {
            Some(key) if key != 0 => key,
            _ => {
                tracing::warn!("Discarding buffer with invalid correlation {}", wire);
                return;
            }
        };

        {
            let mut signals = lock(&self.inner.signals);
            if let Some(entry) = signals.get(&key) {
                if matches!(entry.role, EntryRole::Refused) {
                    if eos {
                        signals.remove(&key);
                        drop(signals);
                        self.inner.drained.notify_waiters();
                        tracing::debug!("Refused correlation {} ended", wire);
                    }
                    return;
                }
                if let EntryRole::Reactor {
                    monitor: Some(monitor),
                    ..
                } = &entry.role
                {
                    monitor.touch();
                }
                match &entry.inbound {
                    Some(inbound) => {
                        if inbound.send(Inbound::Buffer { payload, eos }).is_err() {
                            tracing::trace!("Signal {} no longer reading", entry.signal);
                        }
                    }
                    None => tracing::warn!("Discarding buffer for one-way {}", entry.signal),
                }
                return;
            }
        }

        if wire < 0 {
            tracing::debug!("Discarding late buffer for correlation {}", wire);
            return;
        }
        if payload.remaining() < 2 {
            tracing::warn!("Discarding buffer without signal ID for correlation {}", wire);
            return;
        }
        let signal_id = payload.get_i16();
        self.start_reactor(wire, key, signal_id, payload, eos);
    }

    /// Send a one-way request.
    pub async fn request<R: Request>(&self, request: R) -> Result<()> {
        RequestActor::new(self, request).send().await
    }

    /// Send a request and wait for its confirmation.
    pub async fn send<R: RequestWithConfirmation>(&self, request: R) -> Result<R::Output> {
        ConfirmationActor::new(self, request).send().await
    }

    /// Send a request and wait for its confirmation, waiting at most
    /// `timeout` for each buffer of the peer (`None` = forever).
    pub async fn send_with_timeout<R: RequestWithConfirmation>(
        &self,
        request: R,
        timeout: Option<Duration>,
    ) -> Result<R::Output> {
        ConfirmationActor::new(self, request)
            .send_with_timeout(timeout)
            .await
    }

    /// Send a request on a spawned task.
    pub fn send_async<R: RequestWithConfirmation>(
        &self,
        request: R,
    ) -> JoinHandle<Result<R::Output>> {
        ConfirmationActor::new(self, request).send_async()
    }

    /// Send a monitored request, reporting progress into `monitor`.
    pub async fn send_monitored<R: RequestWithMonitoring>(
        &self,
        request: R,
        monitor: Monitor,
    ) -> Result<R::Output> {
        MonitoringActor::new(self, request).send(monitor).await
    }

    pub(crate) fn set_channel(&self, channel: Arc<dyn Channel>) {
        *lock(&self.inner.channel) = Some(channel);
    }

    pub(crate) fn channel(&self) -> Option<Arc<dyn Channel>> {
        lock(&self.inner.channel).clone()
    }

    /// Mark the protocol active. Requires a bound channel.
    pub(crate) fn start(&self) -> Result<()> {
        let channel = self
            .channel()
            .ok_or_else(|| SignalError::NoChannel(self.inner.protocol_type.clone()))?;

        *lock(&self.inner.state) = ProtocolState::Active;
        tracing::debug!(
            "Activated protocol {} on channel {}",
            self.inner.protocol_type,
            channel.id()
        );
        Ok(())
    }

    pub(crate) async fn after_activate(&self) -> Result<()> {
        if self.inner.config.send_timeout_changes && self.timeout() != DEFAULT_TIMEOUT {
            self.push_timeout().await?;
        }
        Ok(())
    }

    /// Register a one-way exchange and return its output.
    pub(crate) fn start_signal(&self, core: &ActorCore, role: EntryRole) -> Result<SignalOutput> {
        self.register(core, None, role)
    }

    /// Register a two-way exchange and return its output and input.
    pub(crate) fn start_exchange(
        &self,
        core: &ActorCore,
        timeout: Option<Duration>,
        role: EntryRole,
    ) -> Result<(SignalOutput, SignalInput)> {
        let transform = self.stream_wrapper().map(|wrapper| wrapper.wrap_input());
        let (inbound, input) = SignalInput::new(timeout, transform);
        let out = self.register(core, Some(inbound), role)?;
        Ok((out, input))
    }

    /// Remove a finished exchange from the in-flight table.
    pub(crate) fn stop_signal(&self, signal: &Signal, error: Option<&SignalError>) {
        {
            let mut signals = lock(&self.inner.signals);
            let current = signals
                .get(&signal.correlation_id)
                .map_or(false, |entry| entry.signal == *signal);
            if current {
                signals.remove(&signal.correlation_id);
            }
        }
        self.inner.drained.notify_waiters();

        tracing::trace!("Finished {}", signal);
        self.emit(ProtocolEvent::SignalFinished {
            signal: *signal,
            error: error.map(|e| e.to_string()),
        });
    }

    /// Output for the response of a peer-initiated exchange.
    pub(crate) fn reply_output(&self, signal: &Signal) -> Result<SignalOutput> {
        let channel = self
            .channel()
            .ok_or_else(|| SignalError::NoChannel(self.inner.protocol_type.clone()))?;
        let transform = self.stream_wrapper().map(|wrapper| wrapper.wrap_output());
        Ok(SignalOutput::new(channel, signal.correlation_id, None, transform))
    }

    /// Attach the local monitor of a reactor. A cancel that arrived earlier
    /// is applied now.
    pub(crate) fn attach_monitor(&self, correlation_id: i32, monitor: Monitor) {
        let canceled = match lock(&self.inner.signals).get_mut(&correlation_id) {
            Some(SignalEntry {
                role:
                    EntryRole::Reactor {
                        monitor: slot,
                        cancel_pending,
                    },
                ..
            }) => {
                *slot = Some(monitor.clone());
                *cancel_pending
            }
            _ => false,
        };
        if canceled {
            monitor.cancel_with(CANCELED_BY_PEER);
        }
    }

    /// Report `error` to the peer. Failures to send are only logged.
    pub(crate) async fn send_remote_exception(
        &self,
        correlation_id: i32,
        while_responding: bool,
        error: &SignalError,
    ) {
        let request = RemoteExceptionRequest::new(correlation_id, while_responding, error);
        if let Err(e) = self.request(request).await {
            tracing::debug!(
                "Could not report failure of correlation {}: {}",
                correlation_id,
                e
            );
        }
    }

    pub(crate) fn handle_remote_exception(
        &self,
        correlation_id: i32,
        while_responding: bool,
        message: String,
        detail: Option<ErrorDetail>,
    ) {
        let entry = lock(&self.inner.signals).remove(&correlation_id);
        let Some(entry) = entry else {
            tracing::debug!(
                "Remote failure for unknown correlation {}: {}",
                correlation_id,
                message
            );
            return;
        };
        self.inner.drained.notify_waiters();

        match entry.inbound {
            Some(inbound) => {
                let error = RemoteError::new(while_responding, message, detail);
                let _ = inbound.send(Inbound::Failure(error.into()));
            }
            None => tracing::warn!("Remote failure of one-way {}: {}", entry.signal, message),
        }
    }

    pub(crate) fn handle_monitor_progress(&self, correlation_id: i32, total_work: f64, work: f64) {
        let mut signals = lock(&self.inner.signals);
        let Some(entry) = signals.get_mut(&correlation_id) else {
            tracing::trace!("Progress for unknown correlation {}", correlation_id);
            return;
        };

        if let EntryRole::Actor {
            remote_progress: Some(progress),
        } = &mut entry.role
        {
            progress.apply(total_work, work);
        }
        if let Some(inbound) = &entry.inbound {
            let _ = inbound.send(Inbound::Touch);
        }
    }

    pub(crate) fn handle_monitor_canceled(&self, correlation_id: i32) {
        let key = correlation_id.wrapping_neg();
        let monitor = match lock(&self.inner.signals).get_mut(&key) {
            Some(SignalEntry {
                role:
                    EntryRole::Reactor {
                        monitor: Some(monitor),
                        ..
                    },
                ..
            }) => monitor.clone(),
            Some(SignalEntry {
                role: EntryRole::Reactor { cancel_pending, .. },
                ..
            }) => {
                *cancel_pending = true;
                tracing::debug!("Cancel for correlation {} held until it starts", correlation_id);
                return;
            }
            _ => {
                tracing::debug!("Cancel for unknown correlation {}", correlation_id);
                return;
            }
        };
        monitor.cancel_with(CANCELED_BY_PEER);
    }

    pub(crate) fn handle_set_timeout(&self, timeout: Option<Duration>) {
        if self.update_timeout(timeout) {
            tracing::debug!(
                "Peer set timeout of {} to {:?}",
                self.inner.protocol_type,
                timeout
            );
        }
    }

    fn register(
        &self,
        core: &ActorCore,
        inbound: Option<InboundSender>,
        role: EntryRole,
    ) -> Result<SignalOutput> {
        if !Arc::ptr_eq(&core.protocol.inner, &self.inner) {
            return Err(SignalError::WrongProtocol(
                core.protocol.protocol_type().to_string(),
            ));
        }
        if self.state() == ProtocolState::Inactive {
            return Err(SignalError::NotActive(self.inner.protocol_type.clone()));
        }
        let channel = self
            .channel()
            .ok_or_else(|| SignalError::NoChannel(self.inner.protocol_type.clone()))?;

        let signal = core.signal;
        {
            let mut signals = lock(&self.inner.signals);
            if self.state() == ProtocolState::Inactive {
                return Err(SignalError::NotActive(self.inner.protocol_type.clone()));
            }
            if signals.contains_key(&signal.correlation_id) {
                return Err(SignalError::Protocol(format!(
                    "Correlation {} already in flight",
                    signal.correlation_id
                )));
            }
            signals.insert(
                signal.correlation_id,
                SignalEntry {
                    signal,
                    inbound,
                    role,
                },
            );
        }

        tracing::trace!("Scheduled {}", signal);
        self.emit(ProtocolEvent::SignalScheduled { signal });

        let transform = self.stream_wrapper().map(|wrapper| wrapper.wrap_output());
        Ok(SignalOutput::new(
            channel,
            signal.correlation_id,
            Some(signal.id),
            transform,
        ))
    }

    fn start_reactor(&self, wire: i32, key: i32, signal_id: i16, payload: Bytes, eos: bool) {
        let Some(reactor) = self.create_reactor(signal_id) else {
            tracing::warn!("Invalid signal ID {} for correlation {}", signal_id, wire);
            if !eos {
                let signal = Signal {
                    id: signal_id,
                    correlation_id: key,
                    name: "Refused",
                };
                self.insert_entry(
                    key,
                    SignalEntry {
                        signal,
                        inbound: None,
                        role: EntryRole::Refused,
                    },
                );
            }
            let protocol = self.clone();
            tokio::spawn(async move {
                let error = SignalError::UnknownSignal(signal_id);
                protocol.send_remote_exception(wire, false, &error).await;
            });
            return;
        };

        let signal = Signal {
            id: signal_id,
            correlation_id: key,
            name: reactor.name(),
        };
        let transform = self.stream_wrapper().map(|wrapper| wrapper.wrap_input());
        let (inbound, input) = SignalInput::new(self.timeout(), transform);
        let _ = inbound.send(Inbound::Buffer { payload, eos });

        let entry = SignalEntry {
            signal,
            inbound: Some(inbound),
            role: EntryRole::reactor(),
        };
        if !self.insert_entry(key, entry) {
            tracing::debug!("Not starting {} on inactive protocol", signal);
            return;
        }
        tracing::trace!("Scheduled {}", signal);
        self.emit(ProtocolEvent::SignalScheduled { signal });

        let permits = self.inner.permits.clone();
        let protocol = self.clone();
        tokio::spawn(async move {
            // Held until the reactor completes
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            reactor::run(protocol, signal, reactor, input).await;
        });
    }

    /// Add a peer-initiated entry unless the protocol is already inactive.
    fn insert_entry(&self, key: i32, entry: SignalEntry) -> bool {
        let mut signals = lock(&self.inner.signals);
        if self.state() == ProtocolState::Inactive {
            return false;
        }
        signals.insert(key, entry);
        true
    }

    fn create_reactor(&self, signal_id: i16) -> Option<SignalReactor> {
        match signal_id {
            SIGNAL_REMOTE_EXCEPTION => Some(SignalReactor::Indication(Box::new(
                RemoteExceptionIndication::new(self.clone()),
            ))),
            SIGNAL_MONITOR_CANCELED => Some(SignalReactor::Indication(Box::new(
                MonitorCanceledIndication::new(self.clone()),
            ))),
            SIGNAL_MONITOR_PROGRESS => Some(SignalReactor::Indication(Box::new(
                MonitorProgressIndication::new(self.clone()),
            ))),
            SIGNAL_SET_TIMEOUT => Some(SignalReactor::WithResponse(Box::new(
                SetTimeoutIndication::new(self.clone()),
            ))),
            _ => self.inner.factory.as_ref()?.create_signal_reactor(signal_id),
        }
    }

    fn update_timeout(&self, timeout: Option<Duration>) -> bool {
        let old = std::mem::replace(&mut *lock(&self.inner.timeout), timeout);
        if old == timeout {
            return false;
        }
        self.emit(ProtocolEvent::TimeoutChanged { old, new: timeout });
        true
    }

    async fn push_timeout(&self) -> Result<()> {
        let confirmed = self.send(SetTimeoutRequest::new(self.timeout())).await?;
        if !confirmed {
            return Err(SignalError::Protocol("Peer refused timeout".to_string()));
        }
        Ok(())
    }

    /// Go inactive, fail whatever is still in flight and close the channel.
    fn finish_deactivation(&self) {
        // No entry is added once inactive, so the table stays empty
        *lock(&self.inner.state) = ProtocolState::Inactive;
        self.fail_in_flight();

        let channel = lock(&self.inner.channel).take();
        if let Some(channel) = channel {
            channel.close();
        }
        self.inner.deactivated.notify_waiters();
        tracing::debug!("Deactivated protocol {}", self.inner.protocol_type);
    }

    fn fail_in_flight(&self) {
        let entries: Vec<SignalEntry> = lock(&self.inner.signals)
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        if entries.is_empty() {
            return;
        }
        tracing::warn!(
            "Stopping {} signals of {} because of deactivation",
            entries.len(),
            self.inner.protocol_type
        );

        for entry in entries {
            if let Some(inbound) = entry.inbound {
                let error = SignalError::Deactivated(entry.signal.to_string());
                let _ = inbound.send(Inbound::Failure(error));
            }
            if let EntryRole::Reactor {
                monitor: Some(monitor),
                ..
            } = entry.role
            {
                monitor.cancel_with("Protocol deactivated");
            }
        }
        self.inner.drained.notify_waiters();
    }

    fn emit(&self, event: ProtocolEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }
}

impl std::fmt::Debug for SignalProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalProtocol")
            .field("protocol_type", &self.inner.protocol_type)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingChannel;

    fn active(protocol: &SignalProtocol) -> Arc<RecordingChannel> {
        let channel = RecordingChannel::new(256);
        protocol.set_channel(channel.clone());
        protocol.start().unwrap();
        channel
    }

    fn core(protocol: &SignalProtocol) -> ActorCore {
        ActorCore::new(protocol, 7, "Test")
    }

    #[test]
    fn test_start_requires_channel() {
        let protocol = SignalProtocol::builder("test").build();
        assert!(matches!(protocol.start(), Err(SignalError::NoChannel(_))));
        assert_eq!(protocol.state(), ProtocolState::Inactive);
    }

    #[test]
    fn test_start_signal_requires_active() {
        let protocol = SignalProtocol::builder("test").build();
        let core = core(&protocol);
        let result = protocol.start_signal(&core, EntryRole::actor());
        assert!(matches!(result, Err(SignalError::NotActive(_))));
    }

    #[test]
    fn test_start_signal_rejects_foreign_actor() {
        let protocol = SignalProtocol::builder("test").build();
        let other = SignalProtocol::builder("other").build();
        let _channel = active(&protocol);

        let core = core(&other);
        let result = protocol.start_signal(&core, EntryRole::actor());
        assert!(matches!(result, Err(SignalError::WrongProtocol(name)) if name == "other"));
        assert_eq!(protocol.in_flight(), 0);
    }

    #[test]
    fn test_start_signal_rejects_duplicate_correlation() {
        let protocol = SignalProtocol::builder("test").build();
        let _channel = active(&protocol);

        let core = core(&protocol);
        let _out = protocol.start_signal(&core, EntryRole::actor()).unwrap();
        let result = protocol.start_signal(&core, EntryRole::actor());
        assert!(matches!(result, Err(SignalError::Protocol(_))));
        assert_eq!(protocol.in_flight(), 1);

        protocol.stop_signal(&core.signal, None);
        assert_eq!(protocol.in_flight(), 0);
    }

    #[test]
    fn test_correlation_ids_sequential() {
        let protocol = SignalProtocol::builder("test").build();
        assert_eq!(protocol.next_correlation_id(), 1);
        assert_eq!(protocol.next_correlation_id(), 2);
        assert_eq!(core(&protocol).signal.correlation_id, 3);
    }

    #[tokio::test]
    async fn test_late_buffer_dropped() {
        let protocol = SignalProtocol::builder("test").build();
        let _channel = active(&protocol);

        let mut payload = (-5i32).to_be_bytes().to_vec();
        payload.extend_from_slice(b"late");
        protocol.handle_buffer(Bytes::from(payload), true);
        assert_eq!(protocol.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unknown_signal_reported() {
        let protocol = SignalProtocol::builder("test").build();
        let channel = active(&protocol);

        let mut payload = 5i32.to_be_bytes().to_vec();
        payload.extend_from_slice(&77i16.to_be_bytes());
        protocol.handle_buffer(Bytes::from(payload), true);

        for _ in 0..100 {
            if !channel.sent().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        let buffer = &sent[0].0;
        assert_eq!(&buffer[4..6], &SIGNAL_REMOTE_EXCEPTION.to_be_bytes());
        assert_eq!(&buffer[6..10], &5i32.to_be_bytes());
    }

    #[tokio::test]
    async fn test_deactivate_fails_in_flight() {
        let protocol = SignalProtocol::builder("test")
            .deactivation_grace(Duration::from_millis(50))
            .build();
        let channel = active(&protocol);

        let core = core(&protocol);
        let (_out, mut input) = protocol
            .start_exchange(&core, None, EntryRole::actor())
            .unwrap();

        protocol.deactivate().await;

        assert!(matches!(
            input.read_i32().await,
            Err(SignalError::Deactivated(_))
        ));
        assert_eq!(protocol.in_flight(), 0);
        assert_eq!(protocol.state(), ProtocolState::Inactive);
        assert!(channel.is_closed());
    }

    async fn wait_for_sent(channel: &RecordingChannel) {
        for _ in 0..100 {
            if !channel.sent().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_unknown_signal_swallows_rest_of_request() {
        let protocol = SignalProtocol::builder("test").build();
        let channel = active(&protocol);

        let mut first = 5i32.to_be_bytes().to_vec();
        first.extend_from_slice(&77i16.to_be_bytes());
        first.extend_from_slice(&[9, 9, 9]);
        protocol.handle_buffer(Bytes::from(first), false);
        assert_eq!(protocol.in_flight(), 1);

        // Starts like a set-timeout request, but belongs to the refused one
        let mut rest = 5i32.to_be_bytes().to_vec();
        rest.extend_from_slice(&SIGNAL_SET_TIMEOUT.to_be_bytes());
        rest.extend_from_slice(&[42, 42]);
        protocol.handle_buffer(Bytes::from(rest), true);
        assert_eq!(protocol.in_flight(), 0);

        wait_for_sent(&channel).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0].0[4..6], &SIGNAL_REMOTE_EXCEPTION.to_be_bytes());
    }

    #[tokio::test]
    async fn test_next_request_after_refused_one_starts() {
        let protocol = SignalProtocol::builder("test").build();
        let _channel = active(&protocol);

        let mut first = 5i32.to_be_bytes().to_vec();
        first.extend_from_slice(&77i16.to_be_bytes());
        protocol.handle_buffer(Bytes::from(first), false);
        protocol.handle_buffer(Bytes::from(5i32.to_be_bytes().to_vec()), true);
        assert_eq!(protocol.in_flight(), 0);

        let mut next = 6i32.to_be_bytes().to_vec();
        next.extend_from_slice(&SIGNAL_SET_TIMEOUT.to_be_bytes());
        protocol.handle_buffer(Bytes::from(next), false);
        assert_eq!(protocol.in_flight(), 1);
        assert!(matches!(
            lock(&protocol.inner.signals).get(&-6).map(|entry| &entry.role),
            Some(EntryRole::Reactor { .. })
        ));
    }

    #[tokio::test]
    async fn test_reactor_started_while_deactivating_is_failed() {
        let protocol = SignalProtocol::builder("test").timeout(None).build();
        let channel = active(&protocol);
        *lock(&protocol.inner.state) = ProtocolState::Deactivating;

        // Waits for more input forever
        let mut payload = 8i32.to_be_bytes().to_vec();
        payload.extend_from_slice(&SIGNAL_SET_TIMEOUT.to_be_bytes());
        protocol.handle_buffer(Bytes::from(payload), false);
        assert_eq!(protocol.in_flight(), 1);

        protocol.finish_deactivation();
        assert_eq!(protocol.in_flight(), 0);
        assert_eq!(protocol.state(), ProtocolState::Inactive);
        assert!(channel.is_closed());

        let mut late = 9i32.to_be_bytes().to_vec();
        late.extend_from_slice(&SIGNAL_SET_TIMEOUT.to_be_bytes());
        protocol.handle_buffer(Bytes::from(late), false);
        assert_eq!(protocol.in_flight(), 0);
    }

    #[test]
    fn test_entries_refused_once_inactive() {
        let protocol = SignalProtocol::builder("test").build();
        let _channel = active(&protocol);
        *lock(&protocol.inner.state) = ProtocolState::Inactive;

        let signal = Signal {
            id: 9,
            correlation_id: -3,
            name: "Work",
        };
        let entry = SignalEntry {
            signal,
            inbound: None,
            role: EntryRole::reactor(),
        };
        assert!(!protocol.insert_entry(-3, entry));
        assert_eq!(protocol.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_deactivate_waits_for_first() {
        let protocol = SignalProtocol::builder("test")
            .deactivation_grace(Duration::from_millis(200))
            .build();
        let _channel = active(&protocol);

        let core = core(&protocol);
        let _out = protocol.start_signal(&core, EntryRole::actor()).unwrap();

        let first = {
            let protocol = protocol.clone();
            tokio::spawn(async move { protocol.deactivate().await })
        };
        while protocol.state() != ProtocolState::Deactivating {
            tokio::task::yield_now().await;
        }

        protocol.close().await;
        assert_eq!(protocol.state(), ProtocolState::Inactive);
        assert_eq!(protocol.in_flight(), 0);
        first.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_signals() {
        let protocol = SignalProtocol::builder("test").build();
        let _channel = active(&protocol);
        assert!(protocol.wait_for_signals(Duration::from_millis(10)).await);

        let core = core(&protocol);
        let _out = protocol.start_signal(&core, EntryRole::actor()).unwrap();
        assert!(!protocol.wait_for_signals(Duration::from_millis(20)).await);

        let waiter = protocol.clone();
        let waiting =
            tokio::spawn(async move { waiter.wait_for_signals(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        protocol.stop_signal(&core.signal, None);
        assert!(waiting.await.unwrap());
    }

    #[tokio::test]
    async fn test_set_timeout_inactive_not_pushed() {
        let protocol = SignalProtocol::builder("test").build();
        let mut events = protocol.subscribe();

        protocol
            .set_timeout(Some(Duration::from_secs(3)))
            .await
            .unwrap();
        assert_eq!(protocol.timeout(), Some(Duration::from_secs(3)));
        assert_eq!(
            events.try_recv().unwrap(),
            ProtocolEvent::TimeoutChanged {
                old: DEFAULT_TIMEOUT,
                new: Some(Duration::from_secs(3)),
            }
        );

        protocol
            .set_timeout(Some(Duration::from_secs(3)))
            .await
            .unwrap();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_monitor_canceled_by_peer() {
        let protocol = SignalProtocol::builder("test").build();
        let _channel = active(&protocol);

        let signal = Signal {
            id: 9,
            correlation_id: -4,
            name: "Work",
        };
        lock(&protocol.inner.signals).insert(
            -4,
            SignalEntry {
                signal,
                inbound: None,
                role: EntryRole::reactor(),
            },
        );
        let monitor = Monitor::new();
        protocol.attach_monitor(-4, monitor.clone());

        protocol.handle_monitor_canceled(4);
        assert!(monitor.is_canceled());
    }

    #[test]
    fn test_monitor_canceled_before_attached() {
        let protocol = SignalProtocol::builder("test").build();
        let _channel = active(&protocol);

        let signal = Signal {
            id: 9,
            correlation_id: -4,
            name: "Work",
        };
        lock(&protocol.inner.signals).insert(
            -4,
            SignalEntry {
                signal,
                inbound: None,
                role: EntryRole::reactor(),
            },
        );

        protocol.handle_monitor_canceled(4);
        let monitor = Monitor::new();
        assert!(!monitor.is_canceled());
        protocol.attach_monitor(-4, monitor.clone());
        assert!(monitor.is_canceled());
    }

    #[test]
    fn test_cancel_for_unknown_correlation_ignored() {
        let protocol = SignalProtocol::builder("test").build();
        let _channel = active(&protocol);

        protocol.handle_monitor_canceled(11);
        assert_eq!(protocol.in_flight(), 0);
    }
}
