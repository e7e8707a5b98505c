//! Redis-style reply decoding.
//!
//! A small, complete protocol written against the replaying discipline:
//! each reply type is parsed as if all of its bytes were present, and the
//! decoder checkpoints after every header and every array element so a
//! reply split across reads resumes where it stopped.
//!
//! ```text
//! +OK\r\n              status
//! -ERR oops\r\n        error
//! :42\r\n              integer
//! $5\r\nhello\r\n      bulk       ($-1\r\n is null)
//! *2\r\n:1\r\n:2\r\n   multi-bulk (*-1\r\n is null)
//! ```

use crate::replay::{fail, Interrupt, Replay, ReplayContext, ReplayingDecode};
use keelson_core::buffer::ByteBuffer;
use keelson_core::channel::PipelineMessage;
use keelson_core::error::KeelsonError;
use tracing::debug;

const CRLF: &[u8] = b"\r\n";

/// A decoded reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(String),
    Error(String),
    Integer(i64),
    /// `None` is the null bulk string.
    Bulk(Option<ByteBuffer>),
    /// `None` is the null array.
    MultiBulk(Option<Vec<Reply>>),
}

/// Pipeline message for a channel carrying replies: raw bytes before the
/// decoder, replies after it.
#[derive(Debug)]
pub enum ReplyMessage {
    Raw(ByteBuffer),
    Reply(Reply),
}

impl From<Reply> for ReplyMessage {
    fn from(reply: Reply) -> Self {
        Self::Reply(reply)
    }
}

impl PipelineMessage for ReplyMessage {
    fn from_buffer(buf: ByteBuffer) -> Self {
        Self::Raw(buf)
    }

    fn into_buffer(self) -> Result<ByteBuffer, Self> {
        match self {
            Self::Raw(buf) => Ok(buf),
            reply => Err(reply),
        }
    }

    fn summary(&self) -> String {
        match self {
            Self::Raw(buf) => format!("{} raw bytes", buf.readable_bytes()),
            Self::Reply(reply) => format!("{reply:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplyState {
    /// Expecting a top-level reply header.
    #[default]
    ReadInitial,
    /// Header of a bulk string seen, waiting for its body.
    ReadBulk,
    /// Inside an array, expecting the next element's header.
    ReadMultiBulk,
    /// Skipping an oversized bulk string.
    DiscardBulk,
    /// Skipping a header or status line longer than the inline limit.
    DiscardLine,
}

/// An array still collecting elements.
#[derive(Debug)]
struct Pending {
    expected: usize,
    items: Vec<Reply>,
}

#[derive(Debug)]
pub struct ReplyDecoder {
    max_bulk_length: usize,
    max_inline_length: usize,
    bulk_length: usize,
    discard_remaining: usize,
    arrays: Vec<Pending>,
}

impl Default for ReplyDecoder {
    fn default() -> Self {
        Self::new(512 * 1024 * 1024, 64 * 1024)
    }
}

impl ReplyDecoder {
    pub fn new(max_bulk_length: usize, max_inline_length: usize) -> Self {
        Self {
            max_bulk_length,
            max_inline_length,
            bulk_length: 0,
            discard_remaining: 0,
            arrays: Vec::new(),
        }
    }

    /// Arrays currently being filled.
    pub fn depth(&self) -> usize {
        self.arrays.len()
    }

    fn read_line(&mut self, cx: &mut ReplayContext<'_, ReplyState>) -> Replay<String> {
        let max = self.max_inline_length;
        let Some(at) = cx.find(CRLF) else {
            // a trailing '\r' may be the first half of the terminator
            if cx.available() > max + 1 {
                let length = cx.available() as u64;
                let keep = usize::from(ends_with_cr(cx));
                cx.skip(cx.available() - keep)?;
                self.arrays.clear();
                cx.checkpoint_with(ReplyState::DiscardLine);
                return fail(KeelsonError::FrameTooLong { length, max });
            }
            return Err(Interrupt::NeedMore);
        };
        if at > max {
            cx.skip(at + CRLF.len())?;
            return self.reset_with(cx, KeelsonError::FrameTooLong { length: at as u64, max });
        }
        let line = cx.read_bytes(at)?;
        cx.skip(CRLF.len())?;
        match String::from_utf8(line.readable_slice().to_vec()) {
            Ok(line) => Ok(line),
            Err(_) => self.reset_with(cx, KeelsonError::corrupted("reply line is not valid UTF-8")),
        }
    }

    fn read_number(&mut self, cx: &mut ReplayContext<'_, ReplyState>) -> Replay<i64> {
        let line = self.read_line(cx)?;
        match line.parse::<i64>() {
            Ok(n) => Ok(n),
            Err(_) => self.reset_with(cx, KeelsonError::corrupted(format!("invalid number: {line:?}"))),
        }
    }

    /// Abandon whatever was in progress, commit what was read, and fail.
    fn reset_with<T>(&mut self, cx: &mut ReplayContext<'_, ReplyState>, err: KeelsonError) -> Replay<T> {
        self.arrays.clear();
        cx.checkpoint_with(ReplyState::ReadInitial);
        fail(err)
    }

    /// Hand a finished value to the innermost array, closing every array it
    /// completes. Returns the top-level reply once there is one.
    fn complete(&mut self, cx: &mut ReplayContext<'_, ReplyState>, mut value: Reply) -> Option<Reply> {
        loop {
            let Some(top) = self.arrays.last_mut() else {
                cx.checkpoint_with(ReplyState::ReadInitial);
                return Some(value);
            };
            top.items.push(value);
            if top.items.len() < top.expected {
                cx.checkpoint_with(ReplyState::ReadMultiBulk);
                return None;
            }
            let Some(done) = self.arrays.pop() else {
                return None;
            };
            value = Reply::MultiBulk(Some(done.items));
        }
    }

    fn read_value(&mut self, cx: &mut ReplayContext<'_, ReplyState>) -> Replay<Option<Reply>> {
        let value = match cx.read_u8()? {
            b'+' => Reply::Status(self.read_line(cx)?),
            b'-' => Reply::Error(self.read_line(cx)?),
            b':' => Reply::Integer(self.read_number(cx)?),
            b'$' => {
                let length = self.read_number(cx)?;
                if length < 0 {
                    Reply::Bulk(None)
                } else if length as u64 > self.max_bulk_length as u64 {
                    // the body and its CRLF are skipped, the enclosing array is dropped
                    self.arrays.clear();
                    self.discard_remaining = length as usize + CRLF.len();
                    cx.checkpoint_with(ReplyState::DiscardBulk);
                    return fail(KeelsonError::FrameTooLong {
                        length: length as u64,
                        max: self.max_bulk_length,
                    });
                } else {
                    self.bulk_length = length as usize;
                    cx.checkpoint_with(ReplyState::ReadBulk);
                    return self.read_bulk(cx);
                }
            }
            b'*' => {
                let count = self.read_number(cx)?;
                if count < 0 {
                    Reply::MultiBulk(None)
                } else if count == 0 {
                    Reply::MultiBulk(Some(Vec::new()))
                } else {
                    let expected = count as usize;
                    self.arrays.push(Pending {
                        expected,
                        items: Vec::with_capacity(expected.min(1024)),
                    });
                    cx.checkpoint_with(ReplyState::ReadMultiBulk);
                    return Ok(None);
                }
            }
            other => {
                return self.reset_with(cx, KeelsonError::corrupted(format!("unknown reply type byte 0x{other:02x}")));
            }
        };
        Ok(self.complete(cx, value))
    }

    fn read_bulk(&mut self, cx: &mut ReplayContext<'_, ReplyState>) -> Replay<Option<Reply>> {
        cx.ensure(self.bulk_length + CRLF.len())?;
        let body = cx.read_slice(self.bulk_length)?;
        let mut end = [0u8; 2];
        cx.peek(0, &mut end)?;
        cx.skip(CRLF.len())?;
        if end != *CRLF {
            return self.reset_with(cx, KeelsonError::corrupted("bulk string not terminated by CRLF"));
        }
        Ok(self.complete(cx, Reply::Bulk(Some(body))))
    }

    /// Drop the rest of an overlong line through its CRLF.
    fn discard_line(&mut self, cx: &mut ReplayContext<'_, ReplyState>) -> Replay<Option<Reply>> {
        if let Some(at) = cx.find(CRLF) {
            cx.skip(at + CRLF.len())?;
            debug!("overlong reply line discarded");
            cx.checkpoint_with(ReplyState::ReadInitial);
            return Ok(None);
        }
        let keep = usize::from(ends_with_cr(cx));
        let n = cx.available() - keep;
        if n == 0 {
            return Err(Interrupt::NeedMore);
        }
        cx.skip(n)?;
        cx.checkpoint();
        Ok(None)
    }

    fn discard_bulk(&mut self, cx: &mut ReplayContext<'_, ReplyState>) -> Replay<Option<Reply>> {
        let n = self.discard_remaining.min(cx.available());
        cx.ensure(n.max(1))?;
        cx.skip(n)?;
        self.discard_remaining -= n;
        if self.discard_remaining == 0 {
            debug!("oversized bulk string discarded");
            cx.checkpoint_with(ReplyState::ReadInitial);
        } else {
            cx.checkpoint();
        }
        Ok(None)
    }
}

fn ends_with_cr(cx: &ReplayContext<'_, ReplyState>) -> bool {
    cx.readable_slice().last() == Some(&b'\r')
}

impl ReplayingDecode for ReplyDecoder {
    type State = ReplyState;
    type Output = Reply;

    fn decode(&mut self, cx: &mut ReplayContext<'_, ReplyState>) -> Replay<Option<Reply>> {
        match cx.state() {
            ReplyState::ReadInitial | ReplyState::ReadMultiBulk => self.read_value(cx),
            ReplyState::ReadBulk => self.read_bulk(cx),
            ReplyState::DiscardBulk => self.discard_bulk(cx),
            ReplyState::DiscardLine => self.discard_line(cx),
        }
    }
}
