//! Outgoing signal stream.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use super::wrapper::OutputTransform;
use super::{NONE_LENGTH, SIGNAL_HEADER_SIZE};
use crate::codec::MsgPackCodec;
use crate::error::Result;
use crate::transport::Channel;

/// Typed writer for one phase of a signal.
///
/// Writes are staged in memory. [`flush`](SignalOutput::flush) sends every
/// full buffer right away, which lets a signal stream payloads larger than
/// memory it wants to hold. Whatever is left goes out, marked as the end of
/// the phase, when the phase completes.
///
/// Every buffer starts with the correlation ID; the first buffer of an
/// exchange opened by this side also carries the signal ID.
pub struct SignalOutput {
    channel: Arc<dyn Channel>,
    correlation_id: i32,
    signal_id: Option<i16>,
    transform: Option<Box<dyn OutputTransform>>,
    staging: BytesMut,
    encoded: BytesMut,
    buffers_sent: usize,
}

impl SignalOutput {
    pub(crate) fn new(
        channel: Arc<dyn Channel>,
        correlation_id: i32,
        signal_id: Option<i16>,
        transform: Option<Box<dyn OutputTransform>>,
    ) -> Self {
        Self {
            channel,
            correlation_id,
            signal_id,
            transform,
            staging: BytesMut::new(),
            encoded: BytesMut::new(),
            buffers_sent: 0,
        }
    }

    /// Correlation ID written into every buffer.
    pub fn correlation_id(&self) -> i32 {
        self.correlation_id
    }

    /// Number of buffers sent so far.
    pub fn buffers_sent(&self) -> usize {
        self.buffers_sent
    }

    /// Write a signed byte.
    pub fn write_i8(&mut self, value: i8) {
        self.staging.put_i8(value);
    }

    /// Write a boolean as one byte.
    pub fn write_bool(&mut self, value: bool) {
        self.staging.put_u8(u8::from(value));
    }

    /// Write a big-endian `i16`.
    pub fn write_i16(&mut self, value: i16) {
        self.staging.put_i16(value);
    }

    /// Write a big-endian `i32`.
    pub fn write_i32(&mut self, value: i32) {
        self.staging.put_i32(value);
    }

    /// Write a big-endian `i64`.
    pub fn write_i64(&mut self, value: i64) {
        self.staging.put_i64(value);
    }

    /// Write a big-endian `f64`.
    pub fn write_f64(&mut self, value: f64) {
        self.staging.put_f64(value);
    }

    /// Write bytes as-is, without a length prefix.
    pub fn write_raw(&mut self, data: &[u8]) {
        self.staging.put_slice(data);
    }

    /// Write a length-prefixed byte array.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.put_length(data.len());
        self.staging.put_slice(data);
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    /// Write an optional string; `None` is written as length `-1`.
    pub fn write_optional_string(&mut self, value: Option<&str>) {
        match value {
            Some(value) => self.write_string(value),
            None => self.staging.put_i32(NONE_LENGTH),
        }
    }

    /// Write a value encoded with MessagePack, length-prefixed.
    pub fn write_value<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let encoded = MsgPackCodec::encode(value)?;
        self.write_bytes(&encoded);
        Ok(())
    }

    fn put_length(&mut self, len: usize) {
        self.staging.put_i32(i32::try_from(len).unwrap_or(i32::MAX));
    }

    /// Send all complete buffers now.
    pub async fn flush(&mut self) -> Result<()> {
        self.drain_staging()?;
        while self.encoded.len() >= self.room() {
            self.send_chunk(false).await?;
        }
        Ok(())
    }

    /// End the phase.
    ///
    /// The stream transform is finished on every path. On success the
    /// remaining data is sent with the end-of-stream mark; at least one
    /// buffer is sent per phase. On failure `outcome` is returned unchanged
    /// and nothing more is sent.
    pub(crate) async fn complete(&mut self, outcome: Result<()>) -> Result<()> {
        let finished = self.finish_transform();
        outcome?;
        finished?;

        while self.encoded.len() > self.room() {
            self.send_chunk(false).await?;
        }
        self.send_chunk(true).await
    }

    fn drain_staging(&mut self) -> Result<()> {
        if self.staging.is_empty() {
            return Ok(());
        }

        let data = self.staging.split().freeze();
        match self.transform.as_mut() {
            Some(transform) => transform.transform(&data, &mut self.encoded),
            None => {
                self.encoded.extend_from_slice(&data);
                Ok(())
            }
        }
    }

    fn finish_transform(&mut self) -> Result<()> {
        let drained = self.drain_staging();
        let finished = match self.transform.take() {
            Some(mut transform) => transform.finish(&mut self.encoded),
            None => Ok(()),
        };
        drained.and(finished)
    }

    fn header_size(&self) -> usize {
        SIGNAL_HEADER_SIZE + if self.signal_id.is_some() { 2 } else { 0 }
    }

    /// Data bytes that fit into the next buffer.
    fn room(&self) -> usize {
        self.channel
            .buffer_capacity()
            .saturating_sub(self.header_size())
            .max(1)
    }

    async fn send_chunk(&mut self, eos: bool) -> Result<()> {
        let len = self.encoded.len().min(self.room());
        let chunk = self.encoded.split_to(len);

        let mut buffer = BytesMut::with_capacity(self.header_size() + len);
        buffer.put_i32(self.correlation_id);
        if let Some(signal_id) = self.signal_id.take() {
            buffer.put_i16(signal_id);
        }
        buffer.put_slice(&chunk);

        tracing::trace!(
            "Sending buffer for correlation {} ({} bytes, eos={})",
            self.correlation_id,
            buffer.len(),
            eos
        );
        self.send(buffer.freeze(), eos).await
    }

    async fn send(&mut self, buffer: Bytes, eos: bool) -> Result<()> {
        self.channel.send_buffer(buffer, eos).await?;
        self.buffers_sent += 1;
        Ok(())
    }
}

impl std::fmt::Debug for SignalOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalOutput")
            .field("channel", &self.channel.id())
            .field("correlation_id", &self.correlation_id)
            .field("buffers_sent", &self.buffers_sent)
            .finish()
    }
}
