//! # signalwire
//!
//! Multiplexed request/response signals over buffer channels.
//!
//! A [`SignalProtocol`] bound to a channel runs many concurrent exchanges
//! ("signals") at once. Each exchange is tagged with a correlation ID, so
//! buffers of different exchanges interleave freely on the wire.
//!
//! ## Architecture
//!
//! - **Transport** ([`transport`]): a [`Connector`] frames buffer channels
//!   over one byte stream (TCP, Unix socket, in-memory duplex)
//! - **Protocol** ([`protocol`]): in-flight table, routing, timeouts and
//!   lifecycle
//! - **Signals** ([`signal`]): one-way, confirmed and monitored exchanges
//! - **Streams** ([`io`]): typed, chunked reads and writes with optional
//!   stream wrappers
//! - **Progress** ([`monitor`]): hierarchical progress monitors with
//!   cancellation
//!
//! ## Example
//!
//! ```ignore
//! use signalwire::{Connector, Role, SignalProtocol, SignalRegistry};
//!
//! fn text_protocol() -> SignalProtocol {
//!     let mut registry = SignalRegistry::new();
//!     registry
//!         .register_response(UPPERCASE, UppercaseIndication::default)
//!         .expect("fresh registry");
//!     SignalProtocol::builder("text").registry(registry).build()
//! }
//!
//! let server = Connector::builder()
//!     .role(Role::Server)
//!     .acceptor(|_channel_id| Some(text_protocol()))
//!     .connect(server_stream);
//!
//! let client = Connector::builder().connect(client_stream);
//! let protocol = text_protocol();
//! protocol.open(&client).await?;
//!
//! let upper = protocol.send(Uppercase("hello".into())).await?;
//! assert_eq!(upper, "HELLO");
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod io;
pub mod monitor;
pub mod protocol;
pub mod signal;
pub mod transport;

pub use config::ProtocolConfig;
pub use error::{ErrorDetail, RemoteError, Result, SignalError};
pub use io::{SignalInput, SignalOutput, StreamWrapper};
pub use monitor::Monitor;
pub use protocol::{ProtocolEvent, ProtocolState, SignalProtocol, SignalProtocolBuilder};
pub use signal::{
    Indication, IndicationWithMonitoring, IndicationWithResponse, Request,
    RequestWithConfirmation, RequestWithMonitoring, Signal, SignalReactor, SignalRegistry,
};
pub use transport::{Connector, Role};

/// Boxed future returned by signal phase methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
