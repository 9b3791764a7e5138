//! Echo - request/response over a local TCP connection.
//!
//! This example demonstrates:
//! - Accepting channels on the server side with a signal registry
//! - Opening a channel and sending confirmed requests from the client
//! - Running many exchanges concurrently on one channel
//!
//! ```text
//! cargo run --example echo
//! ```

use signalwire::io::{SignalInput, SignalOutput};
use tokio::net::{TcpListener, TcpStream};
use signalwire::{
    BoxFuture, Connector, IndicationWithResponse, RequestWithConfirmation, Result, Role,
    SignalProtocol, SignalRegistry,
};

const ECHO: i16 = 1;

/// Request: a message to echo back.
struct Echo(String);

impl RequestWithConfirmation for Echo {
    type Output = String;

    fn signal_id(&self) -> i16 {
        ECHO
    }

    fn requesting<'a>(&'a mut self, out: &'a mut SignalOutput) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            out.write_string(&self.0);
            Ok(())
        })
    }

    fn confirming<'a>(&'a mut self, input: &'a mut SignalInput) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move { input.read_string().await })
    }
}

/// Reactor: reads the message and answers with it.
#[derive(Default)]
struct EchoIndication(String);

impl IndicationWithResponse for EchoIndication {
    fn indicating<'a>(&'a mut self, input: &'a mut SignalInput) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.0 = input.read_string().await?;
            Ok(())
        })
    }

    fn responding<'a>(&'a mut self, out: &'a mut SignalOutput) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            out.write_string(&format!("echo: {}", self.0));
            Ok(())
        })
    }
}

fn echo_protocol() -> Option<SignalProtocol> {
    let mut registry = SignalRegistry::new();
    if let Err(e) = registry.register_response(ECHO, EchoIndication::default) {
        eprintln!("Cannot register echo: {}", e);
        return None;
    }
    Some(SignalProtocol::builder("echo").registry(registry).build())
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let (client_stream, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let (server_stream, _) = accepted?;

    // Server side: every channel the client opens gets its own protocol
    let _server = Connector::builder()
        .role(Role::Server)
        .acceptor(|_channel_id| echo_protocol())
        .connect(server_stream);

    let client = Connector::builder().connect(client_stream?);
    let protocol = SignalProtocol::builder("echo").build();
    protocol.open(&client).await?;

    let handles: Vec<_> = ["alpha", "beta", "gamma"]
        .iter()
        .map(|message| protocol.send_async(Echo(message.to_string())))
        .collect();
    for handle in handles {
        println!("{}", handle.await??);
    }

    protocol.close().await;
    client.close();
    Ok(())
}
