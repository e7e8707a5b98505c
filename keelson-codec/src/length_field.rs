//! Frames carrying their own length.
//!
//! ```text
//! BEFORE (14 bytes)                 AFTER, strip 2 (12 bytes)
//! +--------+----------------+      +----------------+
//! | Length | Actual Content |----->| Actual Content |
//! | 0x000C | "HELLO, WORLD" |      | "HELLO, WORLD" |
//! +--------+----------------+      +----------------+
//! ```
//!
//! The frame length is `field value + length_adjustment + offset + field
//! length`. Frames longer than `max_frame_length` are skipped in discard mode
//! and reported with exactly one `FrameTooLong`: as soon as the length is
//! seen with `fail_fast`, otherwise after the last byte has been dropped.

use crate::replay::{fail, Replay, ReplayContext, ReplayingDecode};
use keelson_core::buffer::{ByteBuffer, ByteOrder};
use keelson_core::error::{KeelsonError, Result};
use tracing::debug;

/// Decode a 1, 2, 4 or 8 byte unsigned integer.
pub(crate) fn decode_uint(raw: &[u8], order: ByteOrder) -> u64 {
    let fold = |acc: u64, b: &u8| (acc << 8) | u64::from(*b);
    match order {
        ByteOrder::BigEndian => raw.iter().fold(0, fold),
        ByteOrder::LittleEndian => raw.iter().rev().fold(0, fold),
    }
}

pub(crate) fn check_field_length(length: usize) -> Result<()> {
    if matches!(length, 1 | 2 | 4 | 8) {
        Ok(())
    } else {
        Err(KeelsonError::invalid_config(format!(
            "length field length must be 1, 2, 4 or 8, got {length}"
        )))
    }
}

/// Settings for [`LengthFieldDecoder`]. Only built through [`LengthFieldConfig::new`],
/// so the field geometry is always valid:
///
/// ```compile_fail
/// let mut config = keelson_codec::LengthFieldConfig::new(64, 0, 2).unwrap();
/// config.length_field_length = 16;
/// ```
#[derive(Debug, Clone)]
pub struct LengthFieldConfig {
    max_frame_length: usize,
    length_field_offset: usize,
    length_field_length: usize,
    length_adjustment: i64,
    initial_bytes_to_strip: usize,
    fail_fast: bool,
    order: ByteOrder,
}

impl LengthFieldConfig {
    /// Big-endian, no adjustment, no stripping, fail fast.
    pub fn new(max_frame_length: usize, length_field_offset: usize, length_field_length: usize) -> Result<Self> {
        let config = Self {
            max_frame_length,
            length_field_offset,
            length_field_length,
            length_adjustment: 0,
            initial_bytes_to_strip: 0,
            fail_fast: true,
            order: ByteOrder::BigEndian,
        };
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_length_adjustment(mut self, adjustment: i64) -> Self {
        self.length_adjustment = adjustment;
        self
    }

    #[must_use]
    pub fn with_initial_bytes_to_strip(mut self, strip: usize) -> Self {
        self.initial_bytes_to_strip = strip;
        self
    }

    #[must_use]
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    #[must_use]
    pub fn with_order(mut self, order: ByteOrder) -> Self {
        self.order = order;
        self
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    pub fn length_field_offset(&self) -> usize {
        self.length_field_offset
    }

    pub fn length_field_length(&self) -> usize {
        self.length_field_length
    }

    pub fn length_adjustment(&self) -> i64 {
        self.length_adjustment
    }

    pub fn initial_bytes_to_strip(&self) -> usize {
        self.initial_bytes_to_strip
    }

    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    fn validate(&self) -> Result<()> {
        check_field_length(self.length_field_length)?;
        if self.max_frame_length == 0 {
            return Err(KeelsonError::invalid_config("max_frame_length must be positive"));
        }
        if self.length_field_offset + self.length_field_length > self.max_frame_length {
            return Err(KeelsonError::invalid_config(format!(
                "max_frame_length ({}) must cover the length field end ({})",
                self.max_frame_length,
                self.length_field_offset + self.length_field_length
            )));
        }
        Ok(())
    }

    fn header_end(&self) -> usize {
        self.length_field_offset + self.length_field_length
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LengthFieldState {
    #[default]
    Header,
    Discarding,
}

#[derive(Debug)]
pub struct LengthFieldDecoder {
    config: LengthFieldConfig,
    discard_remaining: u64,
    too_long_length: u64,
}

impl LengthFieldDecoder {
    pub fn new(config: LengthFieldConfig) -> Self {
        Self {
            config,
            discard_remaining: 0,
            too_long_length: 0,
        }
    }

    pub fn config(&self) -> &LengthFieldConfig {
        &self.config
    }

    fn too_long(&self) -> KeelsonError {
        KeelsonError::FrameTooLong {
            length: self.too_long_length,
            max: self.config.max_frame_length,
        }
    }

    fn discard(&mut self, cx: &mut ReplayContext<'_, LengthFieldState>) -> Replay<Option<ByteBuffer>> {
        let n = usize::try_from(self.discard_remaining)
            .unwrap_or(usize::MAX)
            .min(cx.available());
        cx.ensure(n.max(1))?;
        cx.skip(n)?;
        self.discard_remaining -= n as u64;
        if self.discard_remaining > 0 {
            cx.checkpoint();
            return Ok(None);
        }
        cx.checkpoint_with(LengthFieldState::Header);
        debug!(length = self.too_long_length, "oversized frame discarded");
        if self.config.fail_fast {
            Ok(None)
        } else {
            fail(self.too_long())
        }
    }
}

impl ReplayingDecode for LengthFieldDecoder {
    type State = LengthFieldState;
    type Output = ByteBuffer;

    fn decode(&mut self, cx: &mut ReplayContext<'_, LengthFieldState>) -> Replay<Option<ByteBuffer>> {
        if cx.state() == LengthFieldState::Discarding {
            return self.discard(cx);
        }

        let header_end = self.config.header_end();
        let mut raw = [0u8; 8];
        let field = &mut raw[..self.config.length_field_length];
        cx.peek(self.config.length_field_offset, field)?;
        let value = decode_uint(field, self.config.order);

        let frame_length = i128::from(value) + i128::from(self.config.length_adjustment) + header_end as i128;
        if frame_length < header_end as i128 {
            cx.skip(header_end)?;
            cx.checkpoint();
            return fail(KeelsonError::corrupted(format!(
                "adjusted frame length ({frame_length}) is less than the length field end offset ({header_end})"
            )));
        }

        if frame_length > self.config.max_frame_length as i128 {
            let frame_length = u64::try_from(frame_length).unwrap_or(u64::MAX);
            self.too_long_length = frame_length;
            let available = cx.available() as u64;
            if available >= frame_length {
                // whole frame already here: drop it in one go
                cx.skip(frame_length as usize)?;
                cx.checkpoint();
                return fail(self.too_long());
            }
            cx.skip(cx.available())?;
            self.discard_remaining = frame_length - available;
            cx.checkpoint_with(LengthFieldState::Discarding);
            if self.config.fail_fast {
                return fail(self.too_long());
            }
            return Ok(None);
        }

        let frame_length = frame_length as usize;
        let strip = self.config.initial_bytes_to_strip;
        if strip > frame_length {
            cx.skip(frame_length)?;
            cx.checkpoint();
            return fail(KeelsonError::corrupted(format!(
                "adjusted frame length ({frame_length}) is less than initial bytes to strip ({strip})"
            )));
        }

        cx.ensure(frame_length)?;
        cx.skip(strip)?;
        let frame = cx.read_slice(frame_length - strip)?;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::{DecodeEvent, ReplayingDecoder};

    fn decoder(config: LengthFieldConfig) -> ReplayingDecoder<LengthFieldDecoder> {
        ReplayingDecoder::new(LengthFieldDecoder::new(config))
    }

    #[test]
    fn config_is_validated() {
        assert!(LengthFieldConfig::new(64, 0, 3).is_err());
        assert!(LengthFieldConfig::new(0, 0, 2).is_err());
        assert!(LengthFieldConfig::new(4, 2, 4).is_err());
        assert!(LengthFieldConfig::new(64, 0, 8).is_ok());
    }

    #[test]
    fn builders_keep_the_validated_geometry() {
        for width in [1usize, 2, 4, 8] {
            let config = LengthFieldConfig::new(64, 1, width)
                .unwrap()
                .with_length_adjustment(-1)
                .with_initial_bytes_to_strip(1 + width)
                .with_fail_fast(false)
                .with_order(ByteOrder::LittleEndian);
            assert_eq!(config.length_field_length(), width);
            assert_eq!(config.length_field_offset(), 1);
            assert_eq!(config.max_frame_length(), 64);

            // marker byte, field holding 3, then two payload bytes
            let mut input = vec![0xEE, 3];
            input.resize(1 + width, 0);
            input.extend_from_slice(b"ok");
            let mut d = decoder(config);
            let events = d.feed(ByteBuffer::copied_from(&input));
            assert!(
                matches!(&events[..], [DecodeEvent::Message(f)] if f.readable_slice() == b"ok"),
                "width {width}"
            );
        }
    }

    #[test]
    fn strips_header_and_honours_adjustment() {
        // length counts the whole frame including its 2-byte header
        let config = LengthFieldConfig::new(64, 0, 2)
            .unwrap()
            .with_length_adjustment(-2)
            .with_initial_bytes_to_strip(2);
        let mut d = decoder(config);
        let events = d.feed(ByteBuffer::copied_from(&[0, 7, b'h', b'e', b'l', b'l', b'o']));
        assert!(matches!(&events[..], [DecodeEvent::Message(f)] if f.readable_slice() == b"hello"));
    }

    #[test]
    fn little_endian_field_after_offset() {
        let config = LengthFieldConfig::new(64, 1, 4)
            .unwrap()
            .with_order(ByteOrder::LittleEndian)
            .with_initial_bytes_to_strip(5);
        let mut d = decoder(config);
        let events = d.feed(ByteBuffer::copied_from(&[0xAA, 3, 0, 0, 0, b'a', b'b', b'c']));
        assert!(matches!(&events[..], [DecodeEvent::Message(f)] if f.readable_slice() == b"abc"));
    }

    #[test]
    fn negative_adjusted_length_is_corrupted() {
        let config = LengthFieldConfig::new(64, 0, 1).unwrap().with_length_adjustment(-5);
        let mut d = decoder(config);
        let events = d.feed(ByteBuffer::copied_from(&[1, 9]));
        assert!(matches!(&events[0], DecodeEvent::Error(KeelsonError::CorruptedFrame(_))));
    }

    #[test]
    fn uint_decoding_respects_order() {
        assert_eq!(decode_uint(&[1, 2], ByteOrder::BigEndian), 0x0102);
        assert_eq!(decode_uint(&[1, 2], ByteOrder::LittleEndian), 0x0201);
        assert_eq!(decode_uint(&[0xFF; 8], ByteOrder::BigEndian), u64::MAX);
    }
}
