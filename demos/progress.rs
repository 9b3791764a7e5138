//! Progress - monitored exchange with remote progress and cancel.
//!
//! This example demonstrates:
//! - Reporting progress from a monitored reactor
//! - Watching the mirrored progress on the requesting side
//! - Canceling a running job on the peer
//!
//! ```text
//! cargo run --example progress
//! ```

use std::time::Duration;

use signalwire::io::{SignalInput, SignalOutput};
use signalwire::{
    BoxFuture, Connector, IndicationWithMonitoring, Monitor, RequestWithMonitoring, Result, Role,
    SignalProtocol, SignalRegistry,
};

const COUNT: i16 = 1;

/// Request: count to `target`, one step at a time.
struct Count {
    target: i32,
}

impl RequestWithMonitoring for Count {
    type Output = i32;

    fn signal_id(&self) -> i16 {
        COUNT
    }

    fn requesting<'a>(
        &'a mut self,
        out: &'a mut SignalOutput,
        monitor: Monitor,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            out.write_i32(self.target);
            monitor.done();
            Ok(())
        })
    }

    fn confirming<'a>(
        &'a mut self,
        input: &'a mut SignalInput,
        monitor: Monitor,
    ) -> BoxFuture<'a, Result<i32>> {
        Box::pin(async move {
            let reached = input.read_i32().await?;
            monitor.done();
            Ok(reached)
        })
    }
}

#[derive(Default)]
struct CountIndication {
    reached: i32,
}

impl IndicationWithMonitoring for CountIndication {
    fn indicating<'a>(
        &'a mut self,
        input: &'a mut SignalInput,
        monitor: Monitor,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let target = input.read_i32().await?;
            monitor.begin(f64::from(target));
            while self.reached < target {
                tokio::time::sleep(Duration::from_millis(200)).await;
                monitor.check_canceled()?;
                self.reached += 1;
                monitor.worked(1.0);
            }
            Ok(())
        })
    }

    fn responding<'a>(
        &'a mut self,
        out: &'a mut SignalOutput,
        _monitor: Monitor,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            out.write_i32(self.reached);
            Ok(())
        })
    }
}

fn count_protocol() -> Option<SignalProtocol> {
    let mut registry = SignalRegistry::new();
    registry
        .register_monitored(COUNT, CountIndication::default)
        .ok()?;
    Some(SignalProtocol::builder("count").registry(registry).build())
}

/// Print the monitor's progress until it is dropped.
fn watch(monitor: Monitor) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        loop {
            ticker.tick().await;
            println!("  progress {:5.1}%", monitor.work());
        }
    })
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let _server = Connector::builder()
        .role(Role::Server)
        .acceptor(|_channel_id| count_protocol())
        .connect(b);
    let client = Connector::builder().connect(a);

    let protocol = SignalProtocol::builder("count").build();
    protocol.open(&client).await?;

    println!("Counting to 10");
    let monitor = Monitor::new();
    let watcher = watch(monitor.clone());
    let reached = protocol
        .send_monitored(Count { target: 10 }, monitor)
        .await?;
    watcher.abort();
    println!("Reached {}", reached);

    println!("Counting to 100, canceled after 2 seconds");
    let monitor = Monitor::new();
    let watcher = watch(monitor.clone());
    let running = {
        let protocol = protocol.clone();
        let monitor = monitor.clone();
        tokio::spawn(async move {
            protocol
                .send_monitored(Count { target: 100 }, monitor)
                .await
        })
    };
    tokio::time::sleep(Duration::from_secs(2)).await;
    monitor.cancel();
    match running.await? {
        Ok(reached) => println!("Reached {} before the cancel arrived", reached),
        Err(e) => println!("Stopped: {}", e),
    }
    watcher.abort();

    protocol.close().await;
    Ok(())
}
