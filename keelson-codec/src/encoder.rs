//! Outbound message encoders.

use crate::length_field::check_field_length;
use keelson_core::buffer::{ByteBuffer, ByteOrder};
use keelson_core::channel::PipelineMessage;
use keelson_core::error::{KeelsonError, Result};
use keelson_core::future::CompletionFuture;
use keelson_core::pipeline::{ChannelHandler, HandlerContext};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// Turns outbound messages into bytes.
pub trait Encode<M = ByteBuffer>: Send + 'static {
    /// Whether this encoder handles `msg`. Others pass through untouched.
    fn accepts(&self, _msg: &M) -> bool {
        true
    }

    fn encode(&mut self, msg: M) -> Result<ByteBuffer>;
}

/// Pipeline adapter for an [`Encode`].
///
/// A failed encode fails the write future and fires an exception event.
pub struct EncoderHandler<E, M = ByteBuffer> {
    encoder: E,
    _message: PhantomData<fn(M)>,
}

impl<E, M> EncoderHandler<E, M> {
    pub fn new(encoder: E) -> Self {
        Self {
            encoder,
            _message: PhantomData,
        }
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }
}

impl<E, M> ChannelHandler<M> for EncoderHandler<E, M>
where
    E: Encode<M>,
    M: PipelineMessage,
{
    fn write(&mut self, ctx: &HandlerContext<M>, msg: M, promise: CompletionFuture) {
        if !self.encoder.accepts(&msg) {
            ctx.write_with(msg, promise);
            return;
        }
        match self.encoder.encode(msg) {
            Ok(buf) => ctx.write_with(M::from_buffer(buf), promise),
            Err(err) => {
                debug!(handler = ctx.name(), error = %err, "encode failed");
                let err = Arc::new(err);
                promise.set_shared_failure(Arc::clone(&err));
                ctx.fire_exception_caught(err);
            }
        }
    }
}

/// Prefixes each buffer with its length.
///
/// The header goes into the buffer's prepend region when there is room,
/// so nothing is copied; otherwise a new buffer holding header and payload
/// is allocated.
#[derive(Debug, Clone)]
pub struct LengthFieldPrepender {
    length_field_length: usize,
    length_adjustment: i64,
    includes_length_field: bool,
    order: ByteOrder,
}

impl LengthFieldPrepender {
    pub fn new(length_field_length: usize) -> Result<Self> {
        check_field_length(length_field_length)?;
        Ok(Self {
            length_field_length,
            length_adjustment: 0,
            includes_length_field: false,
            order: ByteOrder::BigEndian,
        })
    }

    #[must_use]
    pub fn with_length_adjustment(mut self, adjustment: i64) -> Self {
        self.length_adjustment = adjustment;
        self
    }

    /// Count the length field itself in the written length.
    #[must_use]
    pub fn with_includes_length_field(mut self, includes: bool) -> Self {
        self.includes_length_field = includes;
        self
    }

    #[must_use]
    pub fn with_order(mut self, order: ByteOrder) -> Self {
        self.order = order;
        self
    }

    pub fn header_len(&self) -> usize {
        self.length_field_length
    }

    fn header(&self, payload_len: usize) -> Result<([u8; 8], usize)> {
        let n = self.length_field_length;
        let mut length = payload_len as i128 + i128::from(self.length_adjustment);
        if self.includes_length_field {
            length += n as i128;
        }
        if length < 0 {
            return Err(KeelsonError::corrupted(format!(
                "adjusted frame length ({length}) is less than zero"
            )));
        }
        let limit = if n == 8 { u64::MAX as i128 } else { (1i128 << (n * 8)) - 1 };
        if length > limit {
            return Err(KeelsonError::corrupted(format!(
                "frame length {length} does not fit in {n} bytes"
            )));
        }

        let be = (length as u64).to_be_bytes();
        let mut raw = [0u8; 8];
        match self.order {
            ByteOrder::BigEndian => raw[..n].copy_from_slice(&be[8 - n..]),
            ByteOrder::LittleEndian => {
                for (dst, src) in raw[..n].iter_mut().zip(be[8 - n..].iter().rev()) {
                    *dst = *src;
                }
            }
        }
        Ok((raw, n))
    }

    pub fn encode_frame(&self, mut payload: ByteBuffer) -> Result<ByteBuffer> {
        let (raw, n) = self.header(payload.readable_bytes())?;
        if payload.prepend_space() >= n {
            payload.prepend_slice(&raw[..n])?;
            return Ok(payload);
        }
        let mut framed = ByteBuffer::with_capacity(n + payload.readable_bytes());
        framed.write_slice(&raw[..n])?;
        framed.write_buffer(&mut payload)?;
        Ok(framed)
    }
}

impl Encode for LengthFieldPrepender {
    fn encode(&mut self, msg: ByteBuffer) -> Result<ByteBuffer> {
        self.encode_frame(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uses_prepend_region_when_it_fits() {
        let mut payload = ByteBuffer::with_prepend(8, 4);
        payload.write_slice(b"abc").unwrap();
        let framed = LengthFieldPrepender::new(2).unwrap().encode_frame(payload).unwrap();
        assert_eq!(framed.readable_slice(), &[0, 3, b'a', b'b', b'c']);
        assert_eq!(framed.reader_index(), 2);
    }

    #[test]
    fn allocates_when_prepend_region_is_short() {
        let payload = ByteBuffer::copied_from(b"abc");
        let framed = LengthFieldPrepender::new(4)
            .unwrap()
            .with_order(ByteOrder::LittleEndian)
            .with_includes_length_field(true)
            .encode_frame(payload)
            .unwrap();
        assert_eq!(framed.readable_slice(), &[7, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn rejects_lengths_that_do_not_fit() {
        let prepender = LengthFieldPrepender::new(1).unwrap();
        assert!(prepender.encode_frame(ByteBuffer::copied_from(&[0; 256])).is_err());
        assert!(prepender.encode_frame(ByteBuffer::copied_from(&[0; 255])).is_ok());
        let negative = LengthFieldPrepender::new(2).unwrap().with_length_adjustment(-10);
        assert!(negative.encode_frame(ByteBuffer::copied_from(b"x")).is_err());
        assert!(LengthFieldPrepender::new(3).is_err());
    }
}
