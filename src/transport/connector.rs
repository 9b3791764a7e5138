//! Connector - many buffer channels over one byte stream.
//!
//! The connector owns the read loop and the writer task of a connection.
//! Each frame on the stream names its channel; the read loop routes the
//! frame to the protocol bound to that channel.
//!
//! # Example
//!
//! ```ignore
//! use signalwire::transport::{Connector, Role};
//!
//! let server = Connector::builder()
//!     .role(Role::Server)
//!     .acceptor(move |_channel_id| Some(make_protocol()))
//!     .connect(server_stream);
//!
//! let client = Connector::builder().connect(client_stream);
//! protocol.open(&client).await?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::task::JoinHandle;

use super::writer::{spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle};
use super::Channel;
use crate::buffer::{flags, Frame, FrameBuffer, Header, DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::error::{Result, SignalError};
use crate::protocol::SignalProtocol;
use crate::BoxFuture;

/// Smallest usable buffer capacity (signal header plus a few data bytes).
const MIN_BUFFER_CAPACITY: usize = 16;

/// Read chunk size of the read loop.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Which side of the connection this connector is.
///
/// The side decides the sign of locally opened channel IDs, so both ends can
/// open channels without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens channels with positive IDs.
    Client,
    /// Opens channels with negative IDs.
    Server,
}

/// Connector configuration.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Bytes per buffer (signal header included).
    pub buffer_capacity: usize,
    /// Largest frame payload accepted from the peer.
    pub max_payload_size: u32,
    /// Side of the connection.
    pub role: Role,
    /// Writer task settings.
    pub writer: WriterConfig,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            role: Role::Client,
            writer: WriterConfig::default(),
        }
    }
}

type Acceptor = Arc<dyn Fn(i16) -> Option<SignalProtocol> + Send + Sync>;

/// Builder for [`Connector`].
pub struct ConnectorBuilder {
    config: ConnectorConfig,
    acceptor: Option<Acceptor>,
}

impl ConnectorBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: ConnectorConfig::default(),
            acceptor: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ConnectorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the connection side.
    pub fn role(mut self, role: Role) -> Self {
        self.config.role = role;
        self
    }

    /// Set the buffer capacity.
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.buffer_capacity = capacity;
        self
    }

    /// Set the maximum accepted frame payload.
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.config.max_payload_size = size;
        self
    }

    /// Set the writer task configuration.
    pub fn writer_config(mut self, config: WriterConfig) -> Self {
        self.config.writer = config;
        self
    }

    /// Accept channels opened by the peer.
    ///
    /// The callback is invoked with the new channel ID and returns the
    /// protocol to bind, or `None` to refuse the channel.
    pub fn acceptor<F>(mut self, acceptor: F) -> Self
    where
        F: Fn(i16) -> Option<SignalProtocol> + Send + Sync + 'static,
    {
        self.acceptor = Some(Arc::new(acceptor));
        self
    }

    /// Start the connector on a connected stream.
    ///
    /// Spawns the read loop and the writer task, so this must be called from
    /// within a tokio runtime.
    pub fn connect<S>(self, stream: S) -> Connector
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut config = self.config;
        let max_payload = usize::try_from(config.max_payload_size).unwrap_or(usize::MAX);
        config.buffer_capacity = config.buffer_capacity.clamp(MIN_BUFFER_CAPACITY, max_payload);

        let (reader, writer) = tokio::io::split(stream);
        let (writer, _writer_task) = spawn_writer_task(writer, config.writer.clone());

        let inner = Arc::new(ConnectorInner {
            config,
            writer,
            channels: Mutex::new(HashMap::new()),
            next_channel_id: Mutex::new(0),
            acceptor: self.acceptor,
            read_task: Mutex::new(None),
        });

        let task = tokio::spawn(read_loop(reader, inner.clone()));
        *lock(&inner.read_task) = Some(task);

        Connector { inner }
    }
}

impl Default for ConnectorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Multiplexes buffer channels over one byte stream. Cheap to clone.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

struct ConnectorInner {
    config: ConnectorConfig,
    writer: WriterHandle,
    channels: Mutex<HashMap<i16, SignalProtocol>>,
    next_channel_id: Mutex<i16>,
    acceptor: Option<Acceptor>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connector {
    /// Create a connector builder.
    pub fn builder() -> ConnectorBuilder {
        ConnectorBuilder::new()
    }

    /// Get the connector configuration.
    pub fn config(&self) -> &ConnectorConfig {
        &self.inner.config
    }

    /// Number of open channels.
    pub fn channel_count(&self) -> usize {
        lock(&self.inner.channels).len()
    }

    /// Open a new channel, bind `protocol` to it and activate the protocol.
    pub async fn open_channel(&self, protocol: &SignalProtocol) -> Result<()> {
        if self.inner.writer.is_closed() {
            return Err(SignalError::ConnectionClosed);
        }

        let id = self.inner.allocate_channel_id()?;
        let channel = self.inner.new_channel(id);
        protocol.set_channel(channel);
        lock(&self.inner.channels).insert(id, protocol.clone());

        tracing::debug!("Opened channel {} for {}", id, protocol.protocol_type());
        protocol.activate().await
    }

    /// Announce the close of every channel to the peer, stop the read loop
    /// and deactivate every bound protocol.
    pub fn close(&self) {
        if let Some(task) = lock(&self.inner.read_task).take() {
            task.abort();
        }

        let ids: Vec<i16> = lock(&self.inner.channels).keys().copied().collect();
        for id in ids {
            let header = Header::new(id, flags::CLOSE_CHANNEL, 0);
            let _ = self
                .inner
                .writer
                .try_send(OutboundFrame::new(&header, Bytes::new()));
        }
        self.inner.disconnect();
    }
}

impl ConnectorInner {
    fn allocate_channel_id(&self) -> Result<i16> {
        let channels = lock(&self.channels);
        let mut next = lock(&self.next_channel_id);

        for _ in 0..i16::MAX {
            *next = match (*next).checked_add(1) {
                Some(id) if id > 0 => id,
                _ => 1,
            };
            let id = match self.config.role {
                Role::Client => *next,
                Role::Server => -*next,
            };
            if !channels.contains_key(&id) {
                return Ok(id);
            }
        }

        Err(SignalError::Protocol("No free channel ID".to_string()))
    }

    fn new_channel(self: &Arc<Self>, id: i16) -> Arc<StreamChannel> {
        Arc::new(StreamChannel {
            id,
            capacity: self.config.buffer_capacity,
            writer: self.writer.clone(),
            connector: Arc::downgrade(self),
            closed: AtomicBool::new(false),
        })
    }

    fn route(self: &Arc<Self>, frame: Frame) {
        let id = frame.channel_id();

        if frame.is_close() {
            let removed = lock(&self.channels).remove(&id);
            if let Some(protocol) = removed {
                tracing::debug!("Peer closed channel {}", id);
                protocol.handle_channel_deactivation();
            }
            return;
        }

        let bound = lock(&self.channels).get(&id).cloned();
        let protocol = match bound {
            Some(protocol) => protocol,
            None => match self.accept(id) {
                Some(protocol) => protocol,
                None => {
                    tracing::warn!("Discarding buffer for unknown channel {}", id);
                    return;
                }
            },
        };

        protocol.handle_buffer(frame.payload, frame.header.is_eos());
    }

    fn accept(self: &Arc<Self>, id: i16) -> Option<SignalProtocol> {
        let acceptor = self.acceptor.as_ref()?;
        let protocol = acceptor(id)?;

        protocol.set_channel(self.new_channel(id));
        lock(&self.channels).insert(id, protocol.clone());

        if let Err(e) = protocol.start() {
            tracing::error!("Failed to activate accepted channel {}: {}", id, e);
            lock(&self.channels).remove(&id);
            return None;
        }

        tracing::debug!("Accepted channel {} for {}", id, protocol.protocol_type());
        let activated = protocol.clone();
        tokio::spawn(async move {
            if let Err(e) = activated.after_activate().await {
                tracing::warn!("Failed to push timeout on channel {}: {}", id, e);
            }
        });

        Some(protocol)
    }

    fn disconnect(&self) {
        let protocols: Vec<SignalProtocol> = lock(&self.channels).drain().map(|(_, p)| p).collect();
        for protocol in protocols {
            protocol.handle_channel_deactivation();
        }
    }
}

async fn read_loop<R>(mut reader: R, inner: Arc<ConnectorInner>)
where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_max_payload(inner.config.max_payload_size);
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                tracing::debug!("Connection closed by peer");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("Read error: {}", e);
                break;
            }
        };

        let frames = match frame_buffer.push(&chunk[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                tracing::error!("Frame error: {}", e);
                break;
            }
        };

        for frame in frames {
            tracing::trace!(
                "Received buffer on channel {} ({} bytes)",
                frame.channel_id(),
                frame.payload.len()
            );
            inner.route(frame);
        }
    }

    inner.disconnect();
}

/// Channel backed by a connector's writer task.
struct StreamChannel {
    id: i16,
    capacity: usize,
    writer: WriterHandle,
    connector: Weak<ConnectorInner>,
    closed: AtomicBool,
}

impl Channel for StreamChannel {
    fn id(&self) -> i16 {
        self.id
    }

    fn buffer_capacity(&self) -> usize {
        self.capacity
    }

    fn send_buffer(&self, payload: Bytes, eos: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(SignalError::ConnectionClosed);
            }
            let flags = if eos { flags::EOS } else { 0 };
            let length = u32::try_from(payload.len())
                .map_err(|_| SignalError::Protocol("Buffer too large".to_string()))?;
            let header = Header::new(self.id, flags, length);
            self.writer.send(OutboundFrame::new(&header, payload)).await
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let bound = match self.connector.upgrade() {
            Some(inner) => lock(&inner.channels).remove(&self.id).is_some(),
            None => false,
        };
        if !bound {
            return;
        }

        let header = Header::new(self.id, flags::CLOSE_CHANNEL, 0);
        if let Err(e) = self.writer.try_send(OutboundFrame::new(&header, Bytes::new())) {
            tracing::debug!("Could not announce close of channel {}: {}", self.id, e);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
