//! Built-in control signals.
//!
//! | ID | Signal | Payload |
//! |----|--------|---------|
//! | -1 | remote exception | `i32` correlation, `bool` while responding, string message, `bool` + bytes detail |
//! | -2 | monitor canceled | `i32` correlation |
//! | -3 | monitor progress | `i32` correlation, `f64` total work, `f64` work |
//! | -4 | set timeout | `i64` milliseconds (`-1` = none); confirmed with `bool` |
//!
//! The correlation in a payload is always the ID of the exchange as known to
//! the side that started it.

use std::time::Duration;

use super::SignalProtocol;
use crate::codec::MsgPackCodec;
use crate::config::{timeout_from_millis, timeout_to_millis};
use crate::error::{ErrorDetail, Result, SignalError};
use crate::io::{SignalInput, SignalOutput};
use crate::signal::{
    Indication, IndicationWithResponse, Request, RequestWithConfirmation, SIGNAL_MONITOR_CANCELED,
    SIGNAL_MONITOR_PROGRESS, SIGNAL_REMOTE_EXCEPTION, SIGNAL_SET_TIMEOUT,
};
use crate::BoxFuture;

/// Reports a failure of this side to the peer.
pub(crate) struct RemoteExceptionRequest {
    correlation_id: i32,
    while_responding: bool,
    message: String,
    detail: ErrorDetail,
}

impl RemoteExceptionRequest {
    pub(crate) fn new(correlation_id: i32, while_responding: bool, error: &SignalError) -> Self {
        Self {
            correlation_id,
            while_responding,
            message: error.to_string(),
            detail: ErrorDetail::from_error(error),
        }
    }
}

impl Request for RemoteExceptionRequest {
    fn signal_id(&self) -> i16 {
        SIGNAL_REMOTE_EXCEPTION
    }

    fn name(&self) -> &'static str {
        "RemoteException"
    }

    fn requesting<'a>(&'a mut self, out: &'a mut SignalOutput) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            out.write_i32(self.correlation_id);
            out.write_bool(self.while_responding);
            out.write_string(&self.message);
            match MsgPackCodec::encode(&self.detail) {
                Ok(detail) => {
                    out.write_bool(true);
                    out.write_bytes(&detail);
                }
                Err(e) => {
                    tracing::warn!("Could not encode error detail: {}", e);
                    out.write_bool(false);
                }
            }
            Ok(())
        })
    }
}

pub(crate) struct RemoteExceptionIndication {
    protocol: SignalProtocol,
}

impl RemoteExceptionIndication {
    pub(crate) fn new(protocol: SignalProtocol) -> Self {
        Self { protocol }
    }
}

impl Indication for RemoteExceptionIndication {
    fn name(&self) -> &'static str {
        "RemoteException"
    }

    fn indicating<'a>(&'a mut self, input: &'a mut SignalInput) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let correlation_id = input.read_i32().await?;
            let while_responding = input.read_bool().await?;
            let message = input.read_string().await?;
            let detail = if input.read_bool().await? {
                let bytes = input.read_bytes().await?;
                Some(MsgPackCodec::decode(&bytes).unwrap_or_else(|e| {
                    tracing::debug!("Undecodable error detail: {}", e);
                    ErrorDetail::unknown(&message)
                }))
            } else {
                None
            };

            self.protocol
                .handle_remote_exception(correlation_id, while_responding, message, detail);
            Ok(())
        })
    }
}

/// Reports progress of a monitored exchange to the requester.
pub(crate) struct MonitorProgressRequest {
    correlation_id: i32,
    total_work: f64,
    work: f64,
}

impl MonitorProgressRequest {
    pub(crate) fn new(correlation_id: i32, total_work: f64, work: f64) -> Self {
        Self {
            correlation_id,
            total_work,
            work,
        }
    }
}

impl Request for MonitorProgressRequest {
    fn signal_id(&self) -> i16 {
        SIGNAL_MONITOR_PROGRESS
    }

    fn name(&self) -> &'static str {
        "MonitorProgress"
    }

    fn requesting<'a>(&'a mut self, out: &'a mut SignalOutput) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            out.write_i32(self.correlation_id);
            out.write_f64(self.total_work);
            out.write_f64(self.work);
            Ok(())
        })
    }
}

pub(crate) struct MonitorProgressIndication {
    protocol: SignalProtocol,
}

impl MonitorProgressIndication {
    pub(crate) fn new(protocol: SignalProtocol) -> Self {
        Self { protocol }
    }
}

impl Indication for MonitorProgressIndication {
    fn name(&self) -> &'static str {
        "MonitorProgress"
    }

    fn indicating<'a>(&'a mut self, input: &'a mut SignalInput) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let correlation_id = input.read_i32().await?;
            let total_work = input.read_f64().await?;
            let work = input.read_f64().await?;
            self.protocol
                .handle_monitor_progress(correlation_id, total_work, work);
            Ok(())
        })
    }
}

/// Asks the peer to cancel a monitored exchange.
pub(crate) struct MonitorCanceledRequest {
    correlation_id: i32,
}

impl MonitorCanceledRequest {
    pub(crate) fn new(correlation_id: i32) -> Self {
        Self { correlation_id }
    }
}

impl Request for MonitorCanceledRequest {
    fn signal_id(&self) -> i16 {
        SIGNAL_MONITOR_CANCELED
    }

    fn name(&self) -> &'static str {
        "MonitorCanceled"
    }

    fn requesting<'a>(&'a mut self, out: &'a mut SignalOutput) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            out.write_i32(self.correlation_id);
            Ok(())
        })
    }
}

pub(crate) struct MonitorCanceledIndication {
    protocol: SignalProtocol,
}

impl MonitorCanceledIndication {
    pub(crate) fn new(protocol: SignalProtocol) -> Self {
        Self { protocol }
    }
}

impl Indication for MonitorCanceledIndication {
    fn name(&self) -> &'static str {
        "MonitorCanceled"
    }

    fn indicating<'a>(&'a mut self, input: &'a mut SignalInput) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let correlation_id = input.read_i32().await?;
            self.protocol.handle_monitor_canceled(correlation_id);
            Ok(())
        })
    }
}

/// Pushes this side's timeout to the peer.
pub(crate) struct SetTimeoutRequest {
    timeout: Option<Duration>,
}

impl SetTimeoutRequest {
    pub(crate) fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl RequestWithConfirmation for SetTimeoutRequest {
    type Output = bool;

    fn signal_id(&self) -> i16 {
        SIGNAL_SET_TIMEOUT
    }

    fn name(&self) -> &'static str {
        "SetTimeout"
    }

    fn requesting<'a>(&'a mut self, out: &'a mut SignalOutput) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            out.write_i64(timeout_to_millis(self.timeout));
            Ok(())
        })
    }

    fn confirming<'a>(&'a mut self, input: &'a mut SignalInput) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { input.read_bool().await })
    }
}

pub(crate) struct SetTimeoutIndication {
    protocol: SignalProtocol,
}

impl SetTimeoutIndication {
    pub(crate) fn new(protocol: SignalProtocol) -> Self {
        Self { protocol }
    }
}

impl IndicationWithResponse for SetTimeoutIndication {
    fn name(&self) -> &'static str {
        "SetTimeout"
    }

    fn indicating<'a>(&'a mut self, input: &'a mut SignalInput) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let millis = input.read_i64().await?;
            self.protocol.handle_set_timeout(timeout_from_millis(millis));
            Ok(())
        })
    }

    fn responding<'a>(&'a mut self, out: &'a mut SignalOutput) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            out.write_bool(true);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::Inbound;
    use crate::transport::testing::RecordingChannel;
    use bytes::Bytes;

    async fn written<R: Request>(mut request: R) -> Bytes {
        let channel = RecordingChannel::new(4096);
        let mut out = SignalOutput::new(channel.clone(), 1, None, None);
        let requested = request.requesting(&mut out).await;
        out.complete(requested).await.unwrap();
        channel.sent()[0].0.slice(4..)
    }

    fn input_of(payload: Bytes) -> SignalInput {
        let (tx, input) = SignalInput::new(None, None);
        tx.send(Inbound::Buffer { payload, eos: true }).unwrap();
        input
    }

    #[tokio::test]
    async fn test_remote_exception_payload() {
        let error = SignalError::UnknownSignal(9);
        let payload = written(RemoteExceptionRequest::new(12, true, &error)).await;

        let mut input = input_of(payload);
        assert_eq!(input.read_i32().await.unwrap(), 12);
        assert!(input.read_bool().await.unwrap());
        assert_eq!(input.read_string().await.unwrap(), "Invalid signal ID 9");
        assert!(input.read_bool().await.unwrap());
        let detail: ErrorDetail = MsgPackCodec::decode(&input.read_bytes().await.unwrap()).unwrap();
        assert_eq!(detail.kind, "unknown_signal");
        assert!(input.is_finished());
    }

    #[tokio::test]
    async fn test_monitor_progress_payload() {
        let payload = written(MonitorProgressRequest::new(3, 100.0, 42.5)).await;

        let mut input = input_of(payload);
        assert_eq!(input.read_i32().await.unwrap(), 3);
        assert_eq!(input.read_f64().await.unwrap(), 100.0);
        assert_eq!(input.read_f64().await.unwrap(), 42.5);
    }

    #[tokio::test]
    async fn test_set_timeout_payload() {
        let channel = RecordingChannel::new(4096);
        let mut out = SignalOutput::new(channel.clone(), 1, None, None);
        let mut request = SetTimeoutRequest::new(None);
        let requested = request.requesting(&mut out).await;
        out.complete(requested).await.unwrap();

        let payload = channel.sent()[0].0.slice(4..);
        assert_eq!(&payload[..], &(-1i64).to_be_bytes());
    }
}
