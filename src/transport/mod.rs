//! Transport module - buffer channels over byte streams.
//!
//! Provides:
//! - The [`Channel`] seam a protocol writes its buffers to
//! - [`Connector`]: multiplexes many channels over one `AsyncRead + AsyncWrite`
//! - The dedicated writer task shared by all channels of a connection

mod connector;
mod writer;

use bytes::Bytes;

use crate::error::Result;
use crate::BoxFuture;

pub use connector::{Connector, ConnectorBuilder, ConnectorConfig, Role};
pub use writer::{
    spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle, DEFAULT_BACKPRESSURE_TIMEOUT,
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_MAX_PENDING_FRAMES,
};

/// One ordered, reliable lane of buffers between two protocols.
///
/// Buffers are delivered to the peer in the order they are sent. Every buffer
/// carries at most [`buffer_capacity`](Channel::buffer_capacity) bytes.
pub trait Channel: Send + Sync + 'static {
    /// Channel ID, unique per connection.
    fn id(&self) -> i16;

    /// Maximum payload bytes of a single buffer.
    fn buffer_capacity(&self) -> usize;

    /// Send one buffer. `eos` marks the last buffer of a signal phase.
    fn send_buffer(&self, payload: Bytes, eos: bool) -> BoxFuture<'_, Result<()>>;

    /// Close the channel. Idempotent.
    fn close(&self);
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;

    use super::Channel;
    use crate::error::{Result, SignalError};
    use crate::BoxFuture;

    /// Channel that records every buffer instead of sending it.
    pub(crate) struct RecordingChannel {
        capacity: usize,
        sent: Mutex<Vec<(Bytes, bool)>>,
        closed: AtomicBool,
    }

    impl RecordingChannel {
        pub(crate) fn new(capacity: usize) -> Arc<Self> {
            Arc::new(Self {
                capacity,
                sent: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            })
        }

        pub(crate) fn sent(&self) -> Vec<(Bytes, bool)> {
            self.sent.lock().unwrap().clone()
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }
    }

    impl Channel for RecordingChannel {
        fn id(&self) -> i16 {
            1
        }

        fn buffer_capacity(&self) -> usize {
            self.capacity
        }

        fn send_buffer(&self, payload: Bytes, eos: bool) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                if self.is_closed() {
                    return Err(SignalError::ConnectionClosed);
                }
                self.sent.lock().unwrap().push((payload, eos));
                Ok(())
            })
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }
    }
}
