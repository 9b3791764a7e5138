//! Stream wrappers - byte transforms around signal streams.
//!
//! A [`StreamWrapper`] hands out one transform per signal phase. The output
//! transform sees everything a signal writes before it is cut into buffers;
//! the input transform sees every received buffer before typed reads.
//! Compression and encryption plug in here.

use std::sync::Arc;

use bytes::BytesMut;

use crate::error::Result;

/// Transform applied to outgoing signal data.
pub trait OutputTransform: Send {
    /// Transform `data` and append the result to `out`.
    fn transform(&mut self, data: &[u8], out: &mut BytesMut) -> Result<()>;

    /// Flush any state held back by the transform. Called once per phase,
    /// also when the phase failed.
    fn finish(&mut self, _out: &mut BytesMut) -> Result<()> {
        Ok(())
    }
}

/// Transform applied to incoming signal data.
pub trait InputTransform: Send {
    /// Transform `data` and append the result to `out`.
    fn transform(&mut self, data: &[u8], out: &mut BytesMut) -> Result<()>;

    /// Called after the last buffer of the phase arrived.
    fn finish(&mut self, _out: &mut BytesMut) -> Result<()> {
        Ok(())
    }
}

/// Factory of per-phase stream transforms.
pub trait StreamWrapper: Send + Sync + 'static {
    /// Create the transform for one outgoing phase.
    fn wrap_output(&self) -> Box<dyn OutputTransform>;

    /// Create the transform for one incoming phase.
    fn wrap_input(&self) -> Box<dyn InputTransform>;
}

/// Two wrappers applied in sequence.
///
/// Outgoing data passes `outer` first, then `inner`; incoming data passes
/// `inner` first, then `outer`.
pub struct StreamWrapperChain {
    outer: Arc<dyn StreamWrapper>,
    inner: Arc<dyn StreamWrapper>,
}

impl StreamWrapperChain {
    /// Chain `outer` on top of `inner`.
    pub fn new(outer: Arc<dyn StreamWrapper>, inner: Arc<dyn StreamWrapper>) -> Self {
        Self { outer, inner }
    }
}

impl StreamWrapper for StreamWrapperChain {
    fn wrap_output(&self) -> Box<dyn OutputTransform> {
        Box::new(ChainedOutput {
            first: self.outer.wrap_output(),
            second: self.inner.wrap_output(),
            scratch: BytesMut::new(),
        })
    }

    fn wrap_input(&self) -> Box<dyn InputTransform> {
        Box::new(ChainedInput {
            first: self.inner.wrap_input(),
            second: self.outer.wrap_input(),
            scratch: BytesMut::new(),
        })
    }
}

struct ChainedOutput {
    first: Box<dyn OutputTransform>,
    second: Box<dyn OutputTransform>,
    scratch: BytesMut,
}

impl OutputTransform for ChainedOutput {
    fn transform(&mut self, data: &[u8], out: &mut BytesMut) -> Result<()> {
        self.first.transform(data, &mut self.scratch)?;
        let staged = self.scratch.split();
        self.second.transform(&staged, out)
    }

    fn finish(&mut self, out: &mut BytesMut) -> Result<()> {
        let first = self.first.finish(&mut self.scratch);
        let staged = self.scratch.split();
        let second = self.second.transform(&staged, out);
        let last = self.second.finish(out);
        first.and(second).and(last)
    }
}

struct ChainedInput {
    first: Box<dyn InputTransform>,
    second: Box<dyn InputTransform>,
    scratch: BytesMut,
}

impl InputTransform for ChainedInput {
    fn transform(&mut self, data: &[u8], out: &mut BytesMut) -> Result<()> {
        self.first.transform(data, &mut self.scratch)?;
        let staged = self.scratch.split();
        self.second.transform(&staged, out)
    }

    fn finish(&mut self, out: &mut BytesMut) -> Result<()> {
        self.first.finish(&mut self.scratch)?;
        let staged = self.scratch.split();
        self.second.transform(&staged, out)?;
        self.second.finish(out)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// XORs every byte with a key.
    pub(crate) struct XorWrapper(pub(crate) u8);

    struct Xor(u8);

    impl Xor {
        fn apply(&self, data: &[u8], out: &mut BytesMut) {
            out.extend(data.iter().map(|b| b ^ self.0));
        }
    }

    impl OutputTransform for Xor {
        fn transform(&mut self, data: &[u8], out: &mut BytesMut) -> Result<()> {
            self.apply(data, out);
            Ok(())
        }
    }

    impl InputTransform for Xor {
        fn transform(&mut self, data: &[u8], out: &mut BytesMut) -> Result<()> {
            self.apply(data, out);
            Ok(())
        }
    }

    impl StreamWrapper for XorWrapper {
        fn wrap_output(&self) -> Box<dyn OutputTransform> {
            Box::new(Xor(self.0))
        }

        fn wrap_input(&self) -> Box<dyn InputTransform> {
            Box::new(Xor(self.0))
        }
    }

    /// Appends a marker byte in `finish`, and strips it again on input.
    pub(crate) struct TrailerWrapper(pub(crate) u8);

    struct AppendTrailer(u8);

    struct StripTrailer {
        held: Option<u8>,
    }

    impl OutputTransform for AppendTrailer {
        fn transform(&mut self, data: &[u8], out: &mut BytesMut) -> Result<()> {
            out.extend_from_slice(data);
            Ok(())
        }

        fn finish(&mut self, out: &mut BytesMut) -> Result<()> {
            out.extend_from_slice(&[self.0]);
            Ok(())
        }
    }

    impl InputTransform for StripTrailer {
        fn transform(&mut self, data: &[u8], out: &mut BytesMut) -> Result<()> {
            if let Some((last, rest)) = data.split_last() {
                if let Some(held) = self.held.replace(*last) {
                    out.extend_from_slice(&[held]);
                }
                out.extend_from_slice(rest);
            }
            Ok(())
        }
    }

    impl StreamWrapper for TrailerWrapper {
        fn wrap_output(&self) -> Box<dyn OutputTransform> {
            Box::new(AppendTrailer(self.0))
        }

        fn wrap_input(&self) -> Box<dyn InputTransform> {
            Box::new(StripTrailer { held: None })
        }
    }
}
