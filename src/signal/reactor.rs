//! Receiving side of an exchange.

use super::{IndicationWithMonitoring, IndicationWithResponse, Signal, SignalReactor};
use crate::error::Result;
use crate::io::SignalInput;
use crate::monitor::{Monitor, ReportingTask};
use crate::protocol::SignalProtocol;

/// Run a reactor to completion and remove it from the in-flight table.
pub(crate) async fn run(
    protocol: SignalProtocol,
    signal: Signal,
    reactor: SignalReactor,
    mut input: SignalInput,
) {
    let result = match reactor {
        SignalReactor::Indication(mut indication) => indication.indicating(&mut input).await,
        SignalReactor::WithResponse(reactor) => respond(&protocol, &signal, reactor, &mut input).await,
        SignalReactor::WithMonitoring(reactor) => {
            respond_monitored(&protocol, &signal, reactor, &mut input).await
        }
    };

    protocol.stop_signal(&signal, result.as_ref().err());
    if let Err(e) = result {
        if protocol.is_active() {
            tracing::error!("Signal {} failed: {}", signal, e);
        } else {
            tracing::debug!("Signal {} failed after deactivation: {}", signal, e);
        }
    }
}

async fn respond(
    protocol: &SignalProtocol,
    signal: &Signal,
    mut reactor: Box<dyn IndicationWithResponse>,
    input: &mut SignalInput,
) -> Result<()> {
    if let Err(e) = reactor.indicating(input).await {
        protocol.send_remote_exception(-signal.correlation_id, false, &e).await;
        return Err(e);
    }

    let mut out = protocol.reply_output(signal)?;
    let responded = reactor.responding(&mut out).await;
    if let Err(e) = out.complete(responded).await {
        protocol.send_remote_exception(-signal.correlation_id, true, &e).await;
        return Err(e);
    }
    Ok(())
}

async fn respond_monitored(
    protocol: &SignalProtocol,
    signal: &Signal,
    mut reactor: Box<dyn IndicationWithMonitoring>,
    input: &mut SignalInput,
) -> Result<()> {
    let monitor = Monitor::new();
    let indicated = indicate_monitored(protocol, signal, &mut *reactor, input, &monitor).await;
    let (reporting, responding_share) = match indicated {
        Ok(started) => started,
        Err(e) => {
            protocol.send_remote_exception(-signal.correlation_id, false, &e).await;
            return Err(e);
        }
    };

    let result = match protocol.reply_output(signal) {
        Ok(mut out) => {
            let responded = reactor.responding(&mut out, monitor.fork(responding_share)).await;
            out.complete(responded).await
        }
        Err(e) => Err(e),
    };
    drop(reporting);

    if let Err(e) = result {
        protocol.send_remote_exception(-signal.correlation_id, true, &e).await;
        return Err(e);
    }
    monitor.done();
    Ok(())
}

/// Read the monitoring header, start progress reports and run the
/// indicating phase. Returns the reporting task and the share of work left
/// for the response.
async fn indicate_monitored(
    protocol: &SignalProtocol,
    signal: &Signal,
    reactor: &mut dyn IndicationWithMonitoring,
    input: &mut SignalInput,
    monitor: &Monitor,
) -> Result<(ReportingTask, f64)> {
    let progress_seconds = input.read_i32().await?;
    let timeout_seconds = input.read_i32().await?;

    monitor.begin(100.0);
    protocol.attach_monitor(signal.correlation_id, monitor.clone());
    let reporting = ReportingTask::spawn(
        protocol.clone(),
        -signal.correlation_id,
        monitor.clone(),
        progress_seconds,
        timeout_seconds,
    );

    let indicating = f64::from(reactor.indicating_work_percent().clamp(0, 100));
    reactor.indicating(input, monitor.fork(indicating)).await?;
    Ok((reporting, 100.0 - indicating))
}
