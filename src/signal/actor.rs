//! Sending side of an exchange.
//!
//! An actor binds a request to a protocol and reserves its correlation ID
//! when created. Sending registers the exchange in the protocol's in-flight
//! table, runs the phases, and removes the exchange again on every path.

use std::time::Duration;

use tokio::task::JoinHandle;

use super::{Request, RequestWithConfirmation, RequestWithMonitoring, Signal};
use crate::error::{Result, SignalError};
use crate::io::{SignalInput, SignalOutput};
use crate::monitor::{Monitor, RemoteProgress};
use crate::protocol::control::MonitorCanceledRequest;
use crate::protocol::table::EntryRole;
use crate::protocol::SignalProtocol;

/// Protocol binding and identity shared by all actors.
pub(crate) struct ActorCore {
    pub(crate) protocol: SignalProtocol,
    pub(crate) signal: Signal,
}

impl ActorCore {
    pub(crate) fn new(protocol: &SignalProtocol, id: i16, name: &'static str) -> Self {
        Self {
            protocol: protocol.clone(),
            signal: Signal {
                id,
                correlation_id: protocol.next_correlation_id(),
                name,
            },
        }
    }

    fn finish<T>(&self, result: Result<T>) -> Result<T> {
        self.protocol.stop_signal(&self.signal, result.as_ref().err());
        if let Err(e) = &result {
            tracing::debug!("Signal {} failed: {}", self.signal, e);
        }
        result
    }
}

/// Sends a one-way [`Request`].
pub struct RequestActor<R: Request> {
    core: ActorCore,
    request: R,
}

impl<R: Request> RequestActor<R> {
    /// Bind `request` to `protocol` and reserve its correlation ID.
    pub fn new(protocol: &SignalProtocol, request: R) -> Self {
        let core = ActorCore::new(protocol, request.signal_id(), request.name());
        Self { core, request }
    }

    /// Identity of the exchange.
    pub fn signal(&self) -> Signal {
        self.core.signal
    }

    /// Send the request.
    pub async fn send(mut self) -> Result<()> {
        let mut out = self
            .core
            .protocol
            .start_signal(&self.core, EntryRole::actor())?;

        let requested = self.request.requesting(&mut out).await;
        let result = out.complete(requested).await;
        self.core.finish(result)
    }
}

/// Sends a [`RequestWithConfirmation`] and waits for its confirmation.
pub struct ConfirmationActor<R: RequestWithConfirmation> {
    core: ActorCore,
    request: R,
}

impl<R: RequestWithConfirmation> ConfirmationActor<R> {
    /// Bind `request` to `protocol` and reserve its correlation ID.
    pub fn new(protocol: &SignalProtocol, request: R) -> Self {
        let core = ActorCore::new(protocol, request.signal_id(), request.name());
        Self { core, request }
    }

    /// Identity of the exchange.
    pub fn signal(&self) -> Signal {
        self.core.signal
    }

    /// Send the request and wait for the confirmation, using the protocol's
    /// timeout for every wait on the peer.
    pub async fn send(self) -> Result<R::Output> {
        let timeout = self.core.protocol.timeout();
        self.send_with_timeout(timeout).await
    }

    /// Send the request and wait for the confirmation, waiting at most
    /// `timeout` for each buffer of the peer (`None` = forever).
    pub async fn send_with_timeout(mut self, timeout: Option<Duration>) -> Result<R::Output> {
        let (mut out, mut input) =
            self.core
                .protocol
                .start_exchange(&self.core, timeout, EntryRole::actor())?;

        let result = exchange(&mut self.request, &mut out, &mut input).await;
        self.core.finish(result)
    }

    /// Run the exchange on a spawned task.
    pub fn send_async(self) -> JoinHandle<Result<R::Output>> {
        tokio::spawn(self.send())
    }
}

async fn exchange<R: RequestWithConfirmation>(
    request: &mut R,
    out: &mut SignalOutput,
    input: &mut SignalInput,
) -> Result<R::Output> {
    let requested = request.requesting(out).await;
    out.complete(requested).await?;
    request.confirming(input).await
}

/// Sends a [`RequestWithMonitoring`], mirroring the peer's progress into a
/// local [`Monitor`].
pub struct MonitoringActor<R: RequestWithMonitoring> {
    core: ActorCore,
    request: R,
}

impl<R: RequestWithMonitoring> MonitoringActor<R> {
    /// Bind `request` to `protocol` and reserve its correlation ID.
    pub fn new(protocol: &SignalProtocol, request: R) -> Self {
        let core = ActorCore::new(protocol, request.signal_id(), request.name());
        Self { core, request }
    }

    /// Identity of the exchange.
    pub fn signal(&self) -> Signal {
        self.core.signal
    }

    /// Send the request and wait for the confirmation.
    ///
    /// `monitor` is begun with 100 units split between the request, the
    /// peer's work and the confirmation. Canceling it notifies the peer.
    pub async fn send(mut self, monitor: Monitor) -> Result<R::Output> {
        let requesting = self.request.requesting_work_percent();
        let confirming = self.request.confirming_work_percent();
        let remote = 100i32
            .checked_sub(requesting)
            .and_then(|rest| rest.checked_sub(confirming));
        let remote = match remote {
            Some(remote) if requesting >= 0 && confirming >= 0 && remote >= 0 => remote,
            _ => {
                return Err(SignalError::InvalidWorkSplit {
                    requesting,
                    confirming,
                })
            }
        };
        monitor.check_canceled()?;

        monitor.begin(100.0);
        let role = EntryRole::Actor {
            remote_progress: Some(RemoteProgress::new(monitor.fork(f64::from(remote)))),
        };

        let timeout = self.core.protocol.timeout();
        let (mut out, mut input) = self.core.protocol.start_exchange(&self.core, timeout, role)?;
        let watcher = spawn_cancel_watcher(&self.core, &monitor);

        out.write_i32(self.request.monitor_progress_seconds());
        out.write_i32(self.request.monitor_timeout_seconds());

        let requested = self
            .request
            .requesting(&mut out, monitor.fork(f64::from(requesting)))
            .await;
        let result = match out.complete(requested).await {
            Ok(()) => {
                self.request
                    .confirming(&mut input, monitor.fork(f64::from(confirming)))
                    .await
            }
            Err(e) => Err(e),
        };

        watcher.abort();
        if result.is_ok() {
            monitor.done();
        }
        self.core.finish(result)
    }
}

/// Notify the peer once `monitor` gets canceled.
fn spawn_cancel_watcher(core: &ActorCore, monitor: &Monitor) -> JoinHandle<()> {
    let protocol = core.protocol.clone();
    let token = monitor.cancellation_token();
    let correlation_id = core.signal.correlation_id;

    tokio::spawn(async move {
        token.cancelled().await;
        tracing::debug!("Canceling correlation {} on the peer", correlation_id);
        if let Err(e) = protocol
            .request(MonitorCanceledRequest::new(correlation_id))
            .await
        {
            tracing::debug!("Cancel of correlation {} not sent: {}", correlation_id, e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoxFuture;

    struct Split {
        requesting: i32,
        confirming: i32,
    }

    impl RequestWithMonitoring for Split {
        type Output = ();

        fn signal_id(&self) -> i16 {
            1
        }

        fn requesting_work_percent(&self) -> i32 {
            self.requesting
        }

        fn confirming_work_percent(&self) -> i32 {
            self.confirming
        }

        fn requesting<'a>(
            &'a mut self,
            _out: &'a mut SignalOutput,
            _monitor: Monitor,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn confirming<'a>(
            &'a mut self,
            _input: &'a mut SignalInput,
            _monitor: Monitor,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    async fn send_split(requesting: i32, confirming: i32) -> Result<()> {
        let protocol = SignalProtocol::builder("test").build();
        let split = Split {
            requesting,
            confirming,
        };
        MonitoringActor::new(&protocol, split)
            .send(Monitor::new())
            .await
    }

    #[tokio::test]
    async fn test_work_split_rejects_negative_share() {
        let result = send_split(-1, 25).await;
        assert!(matches!(
            result,
            Err(SignalError::InvalidWorkSplit {
                requesting: -1,
                confirming: 25
            })
        ));

        let result = send_split(60, 50).await;
        assert!(matches!(result, Err(SignalError::InvalidWorkSplit { .. })));
    }

    #[tokio::test]
    async fn test_work_split_extreme_values() {
        let result = send_split(i32::MIN, 0).await;
        assert!(matches!(result, Err(SignalError::InvalidWorkSplit { .. })));

        let result = send_split(i32::MAX, i32::MAX).await;
        assert!(matches!(result, Err(SignalError::InvalidWorkSplit { .. })));

        let result = send_split(0, i32::MIN).await;
        assert!(matches!(result, Err(SignalError::InvalidWorkSplit { .. })));
    }

    #[tokio::test]
    async fn test_work_split_checked_before_activation() {
        // Valid split on an unbound protocol fails later, at registration
        let result = send_split(50, 50).await;
        assert!(matches!(result, Err(SignalError::NotActive(_))));
    }
}
