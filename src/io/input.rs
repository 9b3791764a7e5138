//! Incoming signal stream.

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use super::wrapper::InputTransform;
use super::NONE_LENGTH;
use crate::codec::MsgPackCodec;
use crate::error::{Result, SignalError};

/// Event delivered to a signal's input by the protocol.
#[derive(Debug)]
pub(crate) enum Inbound {
    /// Data of one buffer (signal header stripped).
    Buffer { payload: Bytes, eos: bool },
    /// The peer is alive; restart the wait for the next buffer.
    Touch,
    /// Fail the reader.
    Failure(SignalError),
}

/// Sender half feeding a [`SignalInput`].
pub(crate) type InboundSender = mpsc::UnboundedSender<Inbound>;

/// Typed reader for one phase of a signal.
///
/// Each read waits for as many buffers as it needs. Waiting for a single
/// buffer is bounded by the signal's timeout.
pub struct SignalInput {
    rx: mpsc::UnboundedReceiver<Inbound>,
    timeout: Option<Duration>,
    transform: Option<Box<dyn InputTransform>>,
    pending: BytesMut,
    eos: bool,
}

impl SignalInput {
    pub(crate) fn new(
        timeout: Option<Duration>,
        transform: Option<Box<dyn InputTransform>>,
    ) -> (InboundSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let input = Self {
            rx,
            timeout,
            transform,
            pending: BytesMut::new(),
            eos: false,
        };
        (tx, input)
    }

    /// Timeout applied to each wait for a buffer (`None` = forever).
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// `true` once the last buffer of the phase arrived and all its data
    /// was consumed.
    pub fn is_finished(&self) -> bool {
        self.eos && self.pending.is_empty()
    }

    /// Read a signed byte.
    pub async fn read_i8(&mut self) -> Result<i8> {
        self.fill(1).await?;
        Ok(self.pending.get_i8())
    }

    /// Read a boolean (any non-zero byte is `true`).
    pub async fn read_bool(&mut self) -> Result<bool> {
        self.fill(1).await?;
        Ok(self.pending.get_u8() != 0)
    }

    /// Read a big-endian `i16`.
    pub async fn read_i16(&mut self) -> Result<i16> {
        self.fill(2).await?;
        Ok(self.pending.get_i16())
    }

    /// Read a big-endian `i32`.
    pub async fn read_i32(&mut self) -> Result<i32> {
        self.fill(4).await?;
        Ok(self.pending.get_i32())
    }

    /// Read a big-endian `i64`.
    pub async fn read_i64(&mut self) -> Result<i64> {
        self.fill(8).await?;
        Ok(self.pending.get_i64())
    }

    /// Read a big-endian `f64`.
    pub async fn read_f64(&mut self) -> Result<f64> {
        self.fill(8).await?;
        Ok(self.pending.get_f64())
    }

    /// Read exactly `len` bytes, without a length prefix.
    pub async fn read_raw(&mut self, len: usize) -> Result<Bytes> {
        self.fill(len).await?;
        Ok(self.pending.split_to(len).freeze())
    }

    /// Read a length-prefixed byte array.
    pub async fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_length().await?;
        Ok(self.read_raw(len).await?.to_vec())
    }

    /// Read a length-prefixed UTF-8 string.
    pub async fn read_string(&mut self) -> Result<String> {
        let len = self.read_length().await?;
        self.read_utf8(len).await
    }

    /// Read an optional string written with `write_optional_string`.
    pub async fn read_optional_string(&mut self) -> Result<Option<String>> {
        match self.read_i32().await? {
            NONE_LENGTH => Ok(None),
            len => {
                let len = checked_length(len)?;
                self.read_utf8(len).await.map(Some)
            }
        }
    }

    /// Read a MessagePack value written with `write_value`.
    pub async fn read_value<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.read_bytes().await?;
        MsgPackCodec::decode(&bytes)
    }

    /// Read everything up to the end of the phase.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        while !self.eos {
            self.next_buffer().await?;
        }
        Ok(self.pending.split().to_vec())
    }

    async fn read_length(&mut self) -> Result<usize> {
        let len = self.read_i32().await?;
        checked_length(len)
    }

    async fn read_utf8(&mut self, len: usize) -> Result<String> {
        let bytes = self.read_raw(len).await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| SignalError::Protocol(format!("Invalid UTF-8 string: {}", e)))
    }

    /// Wait until at least `n` bytes are available.
    async fn fill(&mut self, n: usize) -> Result<()> {
        while self.pending.len() < n {
            if self.eos {
                return Err(SignalError::EndOfStream);
            }
            self.next_buffer().await?;
        }
        Ok(())
    }

    async fn next_buffer(&mut self) -> Result<()> {
        loop {
            match self.receive().await? {
                Inbound::Buffer { payload, eos } => {
                    match self.transform.as_mut() {
                        Some(transform) => transform.transform(&payload, &mut self.pending)?,
                        None => self.pending.extend_from_slice(&payload),
                    }
                    if eos {
                        self.eos = true;
                        if let Some(mut transform) = self.transform.take() {
                            transform.finish(&mut self.pending)?;
                        }
                    }
                    return Ok(());
                }
                Inbound::Touch => continue,
                Inbound::Failure(e) => return Err(e),
            }
        }
    }

    async fn receive(&mut self) -> Result<Inbound> {
        let event = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.rx.recv())
                .await
                .map_err(|_| SignalError::Timeout(timeout))?,
            None => self.rx.recv().await,
        };
        event.ok_or(SignalError::ConnectionClosed)
    }
}

impl std::fmt::Debug for SignalInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalInput")
            .field("timeout", &self.timeout)
            .field("pending", &self.pending.len())
            .field("eos", &self.eos)
            .finish()
    }
}

fn checked_length(len: i32) -> Result<usize> {
    usize::try_from(len).map_err(|_| SignalError::Protocol(format!("Invalid length prefix {}", len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::wrapper::testing::XorWrapper;
    use crate::io::wrapper::StreamWrapper;

    fn buffer(data: &'static [u8], eos: bool) -> Inbound {
        Inbound::Buffer {
            payload: Bytes::from_static(data),
            eos,
        }
    }

    #[tokio::test]
    async fn test_reads_across_buffers() {
        let (tx, mut input) = SignalInput::new(None, None);
        tx.send(buffer(&[0, 0], false)).unwrap();
        tx.send(buffer(&[0, 5, 0, 0, 0, 2], false)).unwrap();
        tx.send(buffer(b"ok", true)).unwrap();

        assert_eq!(input.read_i32().await.unwrap(), 5);
        assert_eq!(input.read_string().await.unwrap(), "ok");
        assert!(input.is_finished());
    }

    #[tokio::test]
    async fn test_read_past_end() {
        let (tx, mut input) = SignalInput::new(None, None);
        tx.send(buffer(&[1], true)).unwrap();

        assert!(input.read_bool().await.unwrap());
        let result = input.read_i32().await;
        assert!(matches!(result, Err(SignalError::EndOfStream)));
    }

    #[tokio::test]
    async fn test_optional_string() {
        let (tx, mut input) = SignalInput::new(None, None);
        tx.send(buffer(&[0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 1, b'x'], true))
            .unwrap();

        assert_eq!(input.read_optional_string().await.unwrap(), None);
        assert_eq!(
            input.read_optional_string().await.unwrap(),
            Some("x".to_string())
        );
    }

    #[tokio::test]
    async fn test_negative_length_rejected() {
        let (tx, mut input) = SignalInput::new(None, None);
        tx.send(buffer(&[0xFF, 0xFF, 0xFF, 0xFE], true)).unwrap();

        let result = input.read_bytes().await;
        assert!(matches!(result, Err(SignalError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_timeout() {
        let (_tx, mut input) = SignalInput::new(Some(Duration::from_millis(20)), None);

        let result = input.read_i32().await;
        assert!(matches!(result, Err(SignalError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_restarts_timeout() {
        let (tx, mut input) = SignalInput::new(Some(Duration::from_millis(100)), None);

        tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_millis(60)).await;
                tx.send(Inbound::Touch).unwrap();
            }
            tokio::time::sleep(Duration::from_millis(60)).await;
            tx.send(buffer(&[7], true)).unwrap();
        });

        assert_eq!(input.read_i8().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_failure_propagates() {
        let (tx, mut input) = SignalInput::new(None, None);
        tx.send(Inbound::Failure(SignalError::Deactivated("test".to_string())))
            .unwrap();

        let result = input.read_i64().await;
        assert!(matches!(result, Err(SignalError::Deactivated(_))));
    }

    #[tokio::test]
    async fn test_sender_dropped() {
        let (tx, mut input) = SignalInput::new(None, None);
        drop(tx);

        let result = input.read_f64().await;
        assert!(matches!(result, Err(SignalError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_read_to_end_with_transform() {
        let wrapper = XorWrapper(0x01);
        let (tx, mut input) = SignalInput::new(None, Some(wrapper.wrap_input()));
        tx.send(buffer(&[b'a' ^ 0x01, b'b' ^ 0x01], false)).unwrap();
        tx.send(buffer(&[b'c' ^ 0x01], true)).unwrap();

        assert_eq!(input.read_to_end().await.unwrap(), b"abc");
    }
}
