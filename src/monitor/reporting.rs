//! Periodic progress reports from the indicating side.

use std::time::Duration;

use tokio::task::JoinHandle;

use super::Monitor;
use crate::protocol::control::MonitorProgressRequest;
use crate::protocol::SignalProtocol;

/// Background task that reports a monitor's progress to the peer and cancels
/// the monitor when it goes idle for too long.
///
/// The task is aborted when dropped.
pub(crate) struct ReportingTask {
    handle: JoinHandle<()>,
}

impl ReportingTask {
    /// Report every `progress_seconds` (at least 1). A `timeout_seconds` of
    /// zero or less disables the idle timeout.
    pub(crate) fn spawn(
        protocol: SignalProtocol,
        correlation_id: i32,
        monitor: Monitor,
        progress_seconds: i32,
        timeout_seconds: i32,
    ) -> Self {
        let period = Duration::from_secs(u64::try_from(progress_seconds.max(1)).unwrap_or(1));
        let timeout = u64::try_from(timeout_seconds)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let handle = tokio::spawn(report(protocol, correlation_id, monitor, period, timeout));
        Self { handle }
    }
}

impl Drop for ReportingTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn report(
    protocol: SignalProtocol,
    correlation_id: i32,
    monitor: Monitor,
    period: Duration,
    timeout: Option<Duration>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let mut reported = (0.0, 0.0);

    loop {
        ticker.tick().await;
        if monitor.is_canceled() {
            break;
        }

        if let Some(timeout) = timeout {
            if monitor.untouched_for() > timeout {
                tracing::debug!(
                    "Monitor of correlation {} idle for {:?}, canceling",
                    correlation_id,
                    timeout
                );
                monitor.cancel_with(format!("Timeout after {:?} without progress", timeout));
                break;
            }
        }

        let current = (monitor.total_work(), monitor.work());
        if current == reported {
            continue;
        }

        let request = MonitorProgressRequest::new(correlation_id, current.0, current.1);
        match protocol.request(request).await {
            Ok(()) => reported = current,
            Err(e) => tracing::debug!(
                "Progress report for correlation {} failed: {}",
                correlation_id,
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SignalError;

    #[tokio::test(start_paused = true)]
    async fn test_idle_monitor_canceled() {
        let protocol = SignalProtocol::builder("test").build();
        let monitor = Monitor::new();
        monitor.begin(100.0);

        let _task = ReportingTask::spawn(protocol, 1, monitor.clone(), 1, 2);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(matches!(
            monitor.check_canceled(),
            Err(SignalError::Canceled(reason)) if reason.contains("Timeout")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_keeps_monitor_alive() {
        let protocol = SignalProtocol::builder("test").build();
        let monitor = Monitor::new();
        monitor.begin(100.0);

        let _task = ReportingTask::spawn(protocol, 1, monitor.clone(), 1, 2);

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(900)).await;
            monitor.worked(1.0);
        }
        assert!(!monitor.is_canceled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_timeout_when_disabled() {
        let protocol = SignalProtocol::builder("test").build();
        let monitor = Monitor::new();
        monitor.begin(1.0);

        let task = ReportingTask::spawn(protocol, 1, monitor.clone(), 1, 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!monitor.is_canceled());
        drop(task);
    }
}
