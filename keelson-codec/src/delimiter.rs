//! Frames terminated by one of several delimiters.
//!
//! When more than one delimiter occurs in the buffer, the one producing the
//! shortest frame wins. A frame longer than `max_frame_length` before any
//! delimiter shows up puts the decoder in discard mode until the next
//! delimiter; it is reported with exactly one `FrameTooLong`.

use crate::replay::{fail, Interrupt, Replay, ReplayContext, ReplayingDecode};
use bytes::Bytes;
use keelson_core::buffer::ByteBuffer;
use keelson_core::error::{KeelsonError, Result};
use smallvec::{smallvec, SmallVec};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct DelimiterConfig {
    delimiters: SmallVec<[Bytes; 2]>,
    max_frame_length: usize,
    strip_delimiter: bool,
    fail_fast: bool,
}

impl DelimiterConfig {
    pub fn new<I, D>(max_frame_length: usize, delimiters: I) -> Result<Self>
    where
        I: IntoIterator<Item = D>,
        D: Into<Bytes>,
    {
        let config = Self {
            delimiters: delimiters.into_iter().map(Into::into).collect(),
            max_frame_length,
            strip_delimiter: true,
            fail_fast: true,
        };
        config.validate()?;
        Ok(config)
    }

    /// `\r\n` or `\n` terminated lines, delimiter stripped.
    pub fn lines(max_frame_length: usize) -> Result<Self> {
        let config = Self {
            delimiters: smallvec![Bytes::from_static(b"\r\n"), Bytes::from_static(b"\n")],
            max_frame_length,
            strip_delimiter: true,
            fail_fast: true,
        };
        config.validate()?;
        Ok(config)
    }

    /// NUL terminated frames.
    pub fn nul(max_frame_length: usize) -> Result<Self> {
        Self::new(max_frame_length, [Bytes::from_static(b"\0")])
    }

    #[must_use]
    pub fn with_strip_delimiter(mut self, strip: bool) -> Self {
        self.strip_delimiter = strip;
        self
    }

    #[must_use]
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn delimiters(&self) -> &[Bytes] {
        &self.delimiters
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    pub fn strip_delimiter(&self) -> bool {
        self.strip_delimiter
    }

    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    fn validate(&self) -> Result<()> {
        if self.max_frame_length == 0 {
            return Err(KeelsonError::invalid_config("max_frame_length must be positive"));
        }
        if self.delimiters.is_empty() {
            return Err(KeelsonError::invalid_config("at least one delimiter is required"));
        }
        if self.delimiters.iter().any(Bytes::is_empty) {
            return Err(KeelsonError::invalid_config("delimiters must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DelimiterState {
    #[default]
    Scanning,
    Discarding,
}

#[derive(Debug)]
pub struct DelimiterDecoder {
    config: DelimiterConfig,
    too_long_length: u64,
}

impl DelimiterDecoder {
    pub fn new(config: DelimiterConfig) -> Self {
        Self {
            config,
            too_long_length: 0,
        }
    }

    pub fn config(&self) -> &DelimiterConfig {
        &self.config
    }

    /// Shortest frame over all delimiters, as `(frame length, delimiter length)`.
    fn nearest(&self, cx: &ReplayContext<'_, DelimiterState>) -> Option<(usize, usize)> {
        self.config
            .delimiters
            .iter()
            .filter_map(|delim| cx.find(delim).map(|at| (at, delim.len())))
            .min_by_key(|&(at, _)| at)
    }

    fn too_long(&self) -> KeelsonError {
        KeelsonError::FrameTooLong {
            length: self.too_long_length,
            max: self.config.max_frame_length,
        }
    }
}

impl ReplayingDecode for DelimiterDecoder {
    type State = DelimiterState;
    type Output = ByteBuffer;

    fn decode(&mut self, cx: &mut ReplayContext<'_, DelimiterState>) -> Replay<Option<ByteBuffer>> {
        let found = self.nearest(cx);

        if cx.state() == DelimiterState::Discarding {
            return match found {
                Some((at, delim_len)) => {
                    cx.skip(at + delim_len)?;
                    self.too_long_length += at as u64;
                    cx.checkpoint_with(DelimiterState::Scanning);
                    debug!(length = self.too_long_length, "oversized frame discarded");
                    if self.config.fail_fast {
                        Ok(None)
                    } else {
                        fail(self.too_long())
                    }
                }
                None => {
                    let n = cx.available();
                    cx.ensure(n.max(1))?;
                    cx.skip(n)?;
                    self.too_long_length += n as u64;
                    cx.checkpoint();
                    Ok(None)
                }
            };
        }

        match found {
            Some((at, delim_len)) => {
                if at > self.config.max_frame_length {
                    cx.skip(at + delim_len)?;
                    cx.checkpoint();
                    self.too_long_length = at as u64;
                    return fail(self.too_long());
                }
                let frame = if self.config.strip_delimiter {
                    let frame = cx.read_slice(at)?;
                    cx.skip(delim_len)?;
                    frame
                } else {
                    cx.read_slice(at + delim_len)?
                };
                Ok(Some(frame))
            }
            None if cx.available() > self.config.max_frame_length => {
                self.too_long_length = cx.available() as u64;
                cx.skip(cx.available())?;
                cx.checkpoint_with(DelimiterState::Discarding);
                if self.config.fail_fast {
                    fail(self.too_long())
                } else {
                    Ok(None)
                }
            }
            None => Err(Interrupt::NeedMore),
        }
    }
}
