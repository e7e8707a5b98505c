//! Resumable decoding over fragmented input.
//!
//! A [`ReplayingDecode`] implementation is written as straight-line code that
//! assumes every byte it asks for is present. When a read would run past the
//! received data, the [`ReplayContext`] returns [`Interrupt::NeedMore`]; `?`
//! carries it out of `decode`, the driver rewinds the cumulation buffer to the
//! last checkpoint, and the same `decode` runs again from the top once more
//! bytes arrive. A decoder that records `checkpoint_with(state)` after each
//! committed step resumes mid-message instead of re-parsing.
//!
//! Progress rule: every call either consumes input, changes the state, or
//! reports that it has nothing yet. A message decoded without either is a
//! broken decoder and is reported as `CorruptedFrame`.
//!
//! [`ReplayingDecoder`] is the sans-IO driver; [`DecoderHandler`] plugs it
//! into a pipeline.

use keelson_core::buffer::ByteBuffer;
use keelson_core::channel::PipelineMessage;
use keelson_core::error::KeelsonError;
use keelson_core::pipeline::{ChannelHandler, HandlerContext};

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, trace};

/// Why a decode step stopped early.
#[derive(Debug)]
pub enum Interrupt {
    /// Not enough bytes yet. Not an error.
    NeedMore,
    /// The input is bad. Bytes consumed so far stay consumed.
    Fail(KeelsonError),
}

impl From<KeelsonError> for Interrupt {
    fn from(err: KeelsonError) -> Self {
        Self::Fail(err)
    }
}

pub type Replay<T> = Result<T, Interrupt>;

/// Report `err` from a decoder.
///
/// Consume the offending bytes first; a failure that consumed nothing and
/// left the state unchanged stops decoding until more input arrives.
pub fn fail<T>(err: KeelsonError) -> Replay<T> {
    Err(Interrupt::Fail(err))
}

/// A resumable protocol decoder.
pub trait ReplayingDecode {
    /// Where a partly decoded message stands. Reset to `Default` after every
    /// decoded message.
    type State: Copy + Default + Eq + fmt::Debug;

    type Output;

    /// Decode at most one message from the context.
    fn decode(&mut self, cx: &mut ReplayContext<'_, Self::State>) -> Replay<Option<Self::Output>>;

    /// End-of-stream variant, called once after the last `decode` pass.
    fn decode_last(&mut self, cx: &mut ReplayContext<'_, Self::State>) -> Replay<Option<Self::Output>> {
        self.decode(cx)
    }
}

macro_rules! replay_reads {
    ($($read:ident => $ty:ty),* $(,)?) => {
        $(
            pub fn $read(&mut self) -> Replay<$ty> {
                self.ensure(std::mem::size_of::<$ty>())?;
                Ok(self.buf.$read()?)
            }
        )*
    };
}

/// The view of the cumulation buffer a decoder reads through.
pub struct ReplayContext<'a, S> {
    buf: &'a mut ByteBuffer,
    state: &'a mut S,
    checkpoint: &'a mut usize,
    terminated: bool,
}

impl<'a, S: Copy> ReplayContext<'a, S> {
    pub(crate) fn new(
        buf: &'a mut ByteBuffer,
        state: &'a mut S,
        checkpoint: &'a mut usize,
        terminated: bool,
    ) -> Self {
        Self {
            buf,
            state,
            checkpoint,
            terminated,
        }
    }

    pub fn state(&self) -> S {
        *self.state
    }

    pub fn set_state(&mut self, state: S) {
        *self.state = state;
    }

    /// Commit everything read so far. A later `NeedMore` rewinds to here.
    pub fn checkpoint(&mut self) {
        *self.checkpoint = self.buf.reader_index();
    }

    /// Move to `state` and commit.
    pub fn checkpoint_with(&mut self, state: S) {
        self.set_state(state);
        self.checkpoint();
    }

    /// Bytes received and not yet read.
    pub fn available(&self) -> usize {
        self.buf.readable_bytes()
    }

    /// True during the end-of-stream pass: no more bytes will arrive.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn reader_index(&self) -> usize {
        self.buf.reader_index()
    }

    /// `NeedMore` unless `n` bytes are readable.
    pub fn ensure(&self, n: usize) -> Replay<()> {
        if self.buf.readable_bytes() < n {
            return Err(Interrupt::NeedMore);
        }
        Ok(())
    }

    replay_reads! {
        read_u8 => u8,
        read_i8 => i8,
        read_u16 => u16,
        read_i16 => i16,
        read_u32 => u32,
        read_i32 => i32,
        read_u64 => u64,
        read_i64 => i64,
    }

    /// The next byte, without consuming it.
    pub fn peek_u8(&self) -> Replay<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8(self.buf.reader_index())?)
    }

    /// Copy `dst.len()` bytes starting `offset` bytes past the reader index,
    /// without consuming them.
    pub fn peek(&self, offset: usize, dst: &mut [u8]) -> Replay<()> {
        self.ensure(offset + dst.len())?;
        self.buf.get_bytes(self.buf.reader_index() + offset, dst)?;
        Ok(())
    }

    /// Next `n` bytes as a view sharing the cumulation's storage.
    pub fn read_slice(&mut self, n: usize) -> Replay<ByteBuffer> {
        self.ensure(n)?;
        Ok(self.buf.read_slice(n)?)
    }

    /// Next `n` bytes as an owned copy.
    pub fn read_bytes(&mut self, n: usize) -> Replay<ByteBuffer> {
        self.ensure(n)?;
        Ok(self.buf.read_bytes(n)?)
    }

    pub fn skip(&mut self, n: usize) -> Replay<()> {
        self.ensure(n)?;
        self.buf.skip(n)?;
        Ok(())
    }

    /// Offset of `needle` from the reader index, if it is in the readable bytes.
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        self.buf
            .find(needle)
            .map(|at| at - self.buf.reader_index())
    }

    /// The readable bytes.
    pub fn readable_slice(&self) -> &[u8] {
        self.buf.readable_slice()
    }
}

/// Output of a decoding pass.
#[derive(Debug)]
pub enum DecodeEvent<T> {
    Message(T),
    Error(KeelsonError),
}

/// Sans-IO driver around a [`ReplayingDecode`].
///
/// ```
/// use keelson_codec::delimiter::{DelimiterConfig, DelimiterDecoder};
/// use keelson_codec::replay::{DecodeEvent, ReplayingDecoder};
/// use keelson_core::buffer::ByteBuffer;
///
/// let mut lines = ReplayingDecoder::new(DelimiterDecoder::new(DelimiterConfig::lines(64)?));
/// assert!(lines.feed(ByteBuffer::copied_from(b"hel")).is_empty());
/// let events = lines.feed(ByteBuffer::copied_from(b"lo\r\n"));
/// assert!(matches!(&events[..], [DecodeEvent::Message(line)] if line.readable_slice() == b"hello"));
/// # Ok::<(), keelson_core::error::KeelsonError>(())
/// ```
pub struct ReplayingDecoder<D: ReplayingDecode> {
    decoder: D,
    cumulation: ByteBuffer,
    state: D::State,
    checkpoint: usize,
    /// Reader index where the message in progress began.
    message_start: usize,
    consumed: u64,
    terminated: bool,
}

impl<D: ReplayingDecode> ReplayingDecoder<D> {
    pub fn new(decoder: D) -> Self {
        Self {
            decoder,
            cumulation: ByteBuffer::new(),
            state: D::State::default(),
            checkpoint: 0,
            message_start: 0,
            consumed: 0,
            terminated: false,
        }
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    pub fn decoder_mut(&mut self) -> &mut D {
        &mut self.decoder
    }

    pub fn state(&self) -> D::State {
        self.state
    }

    /// Reader index the next pass starts from.
    pub fn checkpoint(&self) -> usize {
        self.checkpoint
    }

    /// Bytes received and not yet committed.
    pub fn buffered(&self) -> usize {
        self.cumulation.readable_bytes()
    }

    /// Total bytes committed since creation.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn is_finished(&self) -> bool {
        self.terminated
    }

    /// Append `input` and decode as much as possible.
    pub fn feed(&mut self, input: ByteBuffer) -> Vec<DecodeEvent<D::Output>> {
        let mut events = Vec::new();
        if self.terminated {
            debug!(bytes = input.readable_bytes(), "input after end of stream dropped");
            return events;
        }
        if let Err(err) = self.cumulate(input) {
            events.push(DecodeEvent::Error(err));
            return events;
        }
        self.run(&mut events);
        events
    }

    /// Final pass at end of stream: decode what is buffered, run the
    /// end-of-stream hook, then drop whatever is still left.
    pub fn finish(&mut self) -> Vec<DecodeEvent<D::Output>> {
        let mut events = Vec::new();
        if self.terminated {
            return events;
        }
        self.terminated = true;
        self.run(&mut events);

        let before = (self.cumulation.reader_index(), self.state);
        let outcome = {
            let mut cx = ReplayContext::new(&mut self.cumulation, &mut self.state, &mut self.checkpoint, true);
            self.decoder.decode_last(&mut cx)
        };
        match outcome {
            Ok(Some(msg)) => {
                self.state = D::State::default();
                self.commit(before.0);
                events.push(DecodeEvent::Message(msg));
            }
            Ok(None) => self.commit(before.0),
            Err(Interrupt::NeedMore) => self.rewind(before.0, &mut events),
            Err(Interrupt::Fail(err)) => {
                self.commit(before.0);
                events.push(DecodeEvent::Error(err));
            }
        }

        let left = self.cumulation.readable_bytes();
        if left > 0 {
            debug!(bytes = left, state = ?self.state, "discarding trailing bytes at end of stream");
        }
        self.cumulation = ByteBuffer::new();
        self.checkpoint = 0;
        self.message_start = 0;
        events
    }

    /// Hand back the bytes of the message in progress and everything after
    /// it, leaving the decoder empty. Headers already committed are included.
    pub fn take_buffered(&mut self) -> Option<ByteBuffer> {
        if self.cumulation.writer_index() <= self.message_start {
            return None;
        }
        self.cumulation.set_reader_index(self.message_start).ok()?;
        self.checkpoint = 0;
        self.message_start = 0;
        self.state = D::State::default();
        Some(std::mem::take(&mut self.cumulation))
    }

    fn cumulate(&mut self, mut input: ByteBuffer) -> keelson_core::error::Result<()> {
        if !input.is_readable() {
            return Ok(());
        }
        if self.cumulation.writer_index() > self.message_start {
            // keep the committed part of the message in progress
            let resume = self.cumulation.reader_index() - self.message_start;
            self.cumulation.set_reader_index(self.message_start)?;
            self.cumulation.discard_read_bytes();
            // slices handed in by an upstream decoder cannot grow
            let needed = self.cumulation.writer_index() + input.readable_bytes();
            if needed > self.cumulation.max_capacity() {
                let mut merged = ByteBuffer::with_capacity(needed);
                merged.write_buffer(&mut self.cumulation)?;
                self.cumulation = merged;
            }
            self.cumulation.write_buffer(&mut input)?;
            self.message_start = 0;
            self.cumulation.set_reader_index(resume)?;
        } else {
            self.cumulation = input;
            self.message_start = self.cumulation.reader_index();
        }
        self.checkpoint = self.cumulation.reader_index();
        Ok(())
    }

    fn run(&mut self, events: &mut Vec<DecodeEvent<D::Output>>) {
        while self.cumulation.is_readable() {
            let before = (self.cumulation.reader_index(), self.state);
            let outcome = {
                let mut cx = ReplayContext::new(
                    &mut self.cumulation,
                    &mut self.state,
                    &mut self.checkpoint,
                    self.terminated,
                );
                self.decoder.decode(&mut cx)
            };
            let progressed = self.cumulation.reader_index() != before.0 || self.state != before.1;

            match outcome {
                Ok(Some(msg)) => {
                    if !progressed {
                        events.push(DecodeEvent::Error(KeelsonError::corrupted(
                            "decoder produced a message without consuming input",
                        )));
                        break;
                    }
                    self.state = D::State::default();
                    self.commit(before.0);
                    self.message_start = self.checkpoint;
                    events.push(DecodeEvent::Message(msg));
                }
                Ok(None) => {
                    self.commit(before.0);
                    if progressed && self.state == D::State::default() {
                        self.message_start = self.checkpoint;
                    }
                    if !progressed {
                        break;
                    }
                }
                Err(Interrupt::NeedMore) => {
                    self.rewind(before.0, events);
                    trace!(checkpoint = self.checkpoint, state = ?self.state, "need more input");
                    break;
                }
                Err(Interrupt::Fail(err)) => {
                    self.commit(before.0);
                    self.message_start = self.checkpoint;
                    events.push(DecodeEvent::Error(err));
                    if !progressed {
                        break;
                    }
                }
            }
        }
    }

    fn commit(&mut self, started_at: usize) {
        let at = self.cumulation.reader_index();
        self.consumed += (at - started_at) as u64;
        self.checkpoint = at;
    }

    fn rewind(&mut self, started_at: usize, events: &mut Vec<DecodeEvent<D::Output>>) {
        self.consumed += self.checkpoint.saturating_sub(started_at) as u64;
        if let Err(err) = self.cumulation.set_reader_index(self.checkpoint) {
            events.push(DecodeEvent::Error(err));
        }
    }
}

impl<D: ReplayingDecode> fmt::Debug for ReplayingDecoder<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayingDecoder")
            .field("state", &self.state)
            .field("checkpoint", &self.checkpoint)
            .field("buffered", &self.buffered())
            .field("terminated", &self.terminated)
            .finish()
    }
}

/// Pipeline adapter for a [`ReplayingDecode`].
///
/// Buffers are decoded and each message is fired on as `M`; messages that
/// are not buffers pass through untouched. Decode errors become exception
/// events and never close the channel. When the channel goes inactive the
/// final pass runs before `channel_inactive` moves on; when the handler is
/// removed, undecoded bytes are forwarded to the next handler.
pub struct DecoderHandler<D: ReplayingDecode, M = ByteBuffer> {
    inner: ReplayingDecoder<D>,
    _message: PhantomData<fn(M)>,
}

impl<D: ReplayingDecode, M> DecoderHandler<D, M> {
    pub fn new(decoder: D) -> Self {
        Self {
            inner: ReplayingDecoder::new(decoder),
            _message: PhantomData,
        }
    }

    pub fn driver(&self) -> &ReplayingDecoder<D> {
        &self.inner
    }
}

fn dispatch<T, M>(ctx: &HandlerContext<M>, events: Vec<DecodeEvent<T>>)
where
    T: Into<M>,
    M: PipelineMessage,
{
    for event in events {
        match event {
            DecodeEvent::Message(msg) => ctx.fire_channel_read(msg.into()),
            DecodeEvent::Error(err) => ctx.fire_exception_caught(Arc::new(err)),
        }
    }
}

impl<D, M> ChannelHandler<M> for DecoderHandler<D, M>
where
    D: ReplayingDecode + Send + 'static,
    D::State: Send,
    D::Output: Into<M>,
    M: PipelineMessage,
{
    fn handler_removed(&mut self, ctx: &HandlerContext<M>) {
        if let Some(rest) = self.inner.take_buffered() {
            trace!(bytes = rest.readable_bytes(), "forwarding undecoded bytes");
            ctx.fire_channel_read(M::from_buffer(rest));
            ctx.fire_channel_read_complete();
        }
    }

    fn channel_read(&mut self, ctx: &HandlerContext<M>, msg: M) {
        match msg.into_buffer() {
            Ok(buf) => {
                let events = self.inner.feed(buf);
                dispatch(ctx, events);
            }
            Err(other) => ctx.fire_channel_read(other),
        }
    }

    fn channel_inactive(&mut self, ctx: &HandlerContext<M>) {
        let events = self.inner.finish();
        dispatch(ctx, events);
        ctx.fire_channel_inactive();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// u16 length followed by that many bytes, with a checkpoint after the
    /// length so a split body does not re-read it.
    #[derive(Default)]
    struct Prefixed {
        len: usize,
        header_reads: usize,
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    enum Step {
        #[default]
        Header,
        Body,
    }

    impl ReplayingDecode for Prefixed {
        type State = Step;
        type Output = Vec<u8>;

        fn decode(&mut self, cx: &mut ReplayContext<'_, Step>) -> Replay<Option<Vec<u8>>> {
            if cx.state() == Step::Header {
                self.header_reads += 1;
                self.len = usize::from(cx.read_u16()?);
                cx.checkpoint_with(Step::Body);
            }
            let body = cx.read_slice(self.len)?;
            Ok(Some(body.readable_slice().to_vec()))
        }
    }

    fn messages<T>(events: Vec<DecodeEvent<T>>) -> Vec<T> {
        events
            .into_iter()
            .map(|e| match e {
                DecodeEvent::Message(m) => m,
                DecodeEvent::Error(err) => panic!("unexpected error: {err}"),
            })
            .collect()
    }

    #[test]
    fn resumes_from_the_checkpointed_state() {
        let mut d = ReplayingDecoder::new(Prefixed::default());
        assert!(d.feed(ByteBuffer::copied_from(&[0, 5, b'a'])).is_empty());
        assert_eq!(d.state(), Step::Body);
        assert_eq!(d.checkpoint(), 2);

        assert!(d.feed(ByteBuffer::copied_from(b"bc")).is_empty());
        let out = messages(d.feed(ByteBuffer::copied_from(b"de")));
        assert_eq!(out, [b"abcde".to_vec()]);
        assert_eq!(d.decoder().header_reads, 1);
        assert_eq!(d.state(), Step::Header);
        assert_eq!(d.consumed(), 7);
        assert_eq!(d.buffered(), 0);
    }

    #[test]
    fn several_messages_in_one_read() {
        let mut d = ReplayingDecoder::new(Prefixed::default());
        let out = messages(d.feed(ByteBuffer::copied_from(&[0, 1, b'x', 0, 2, b'y', b'z', 0])));
        assert_eq!(out, [b"x".to_vec(), b"yz".to_vec()]);
        assert_eq!(d.buffered(), 1);
    }

    struct Lazy;

    impl ReplayingDecode for Lazy {
        type State = ();
        type Output = ();

        fn decode(&mut self, _cx: &mut ReplayContext<'_, ()>) -> Replay<Option<()>> {
            Ok(Some(()))
        }
    }

    #[test]
    fn message_without_progress_is_reported() {
        let mut d = ReplayingDecoder::new(Lazy);
        let events = d.feed(ByteBuffer::copied_from(b"abc"));
        assert!(matches!(&events[..], [DecodeEvent::Error(KeelsonError::CorruptedFrame(_))]));
        assert_eq!(d.buffered(), 3);
    }

    #[test]
    fn finish_drops_trailing_bytes_and_ignores_later_input() {
        let mut d = ReplayingDecoder::new(Prefixed::default());
        d.feed(ByteBuffer::copied_from(&[0, 9, 1, 2]));
        assert!(d.finish().is_empty());
        assert!(d.is_finished());
        assert_eq!(d.buffered(), 0);
        assert!(d.feed(ByteBuffer::copied_from(&[0, 1, 1])).is_empty());
    }

    #[test]
    fn take_buffered_returns_undecoded_bytes() {
        let mut d = ReplayingDecoder::new(Prefixed::default());
        d.feed(ByteBuffer::copied_from(&[0, 3, b'a']));
        let rest = d.take_buffered().unwrap();
        assert_eq!(rest.readable_slice(), &[0, 3, b'a']);
        assert_eq!(d.state(), Step::Header);
        assert!(d.take_buffered().is_none());
    }

    #[test]
    fn take_buffered_keeps_a_committed_header_across_reads() {
        let mut d = ReplayingDecoder::new(Prefixed::default());
        let out = messages(d.feed(ByteBuffer::copied_from(&[0, 1, b'x', 0, 3])));
        assert_eq!(out, [b"x".to_vec()]);
        assert_eq!(d.state(), Step::Body);

        assert!(d.feed(ByteBuffer::copied_from(b"a")).is_empty());
        let rest = d.take_buffered().unwrap();
        assert_eq!(rest.readable_slice(), &[0, 3, b'a']);
        assert_eq!(d.checkpoint(), 0);
    }
}
