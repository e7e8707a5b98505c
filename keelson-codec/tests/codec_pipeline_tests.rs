//! Decoders and encoders running inside embedded channel pipelines.

use keelson_codec::prelude::*;
use keelson_core::prelude::*;

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = (payload.len() as u16).to_be_bytes().to_vec();
    out.extend_from_slice(payload);
    out
}

fn length_field_channel(config: LengthFieldConfig) -> EmbeddedChannel {
    let ch = EmbeddedChannel::new();
    ch.pipeline()
        .add_last("frames", DecoderHandler::new(LengthFieldDecoder::new(config)))
        .unwrap();
    ch
}

fn drain(ch: &EmbeddedChannel) -> Vec<Vec<u8>> {
    std::iter::from_fn(|| ch.read_inbound())
        .map(|b| b.readable_slice().to_vec())
        .collect()
}

#[test]
fn length_field_frames_survive_any_split() {
    let mut stream = frame(b"first");
    stream.extend(frame(b""));
    stream.extend(frame(b"third frame"));
    let expected = [b"first".to_vec(), Vec::new(), b"third frame".to_vec()];

    for split in 0..=stream.len() {
        let config = LengthFieldConfig::new(64, 0, 2).unwrap().with_initial_bytes_to_strip(2);
        let ch = length_field_channel(config);
        ch.write_inbound(ByteBuffer::copied_from(&stream[..split]));
        ch.write_inbound(ByteBuffer::copied_from(&stream[split..]));
        assert_eq!(drain(&ch), expected, "split at {split}");
        ch.check_exception().unwrap();
    }

    // and byte by byte
    let config = LengthFieldConfig::new(64, 0, 2).unwrap().with_initial_bytes_to_strip(2);
    let ch = length_field_channel(config);
    ch.write_inbound_all(stream.iter().map(|b| ByteBuffer::copied_from(&[*b])));
    assert_eq!(drain(&ch), expected);
}

fn oversized_then_small(fail_fast: bool) {
    let config = LengthFieldConfig::new(8, 0, 2)
        .unwrap()
        .with_initial_bytes_to_strip(2)
        .with_fail_fast(fail_fast);
    let ch = length_field_channel(config);

    let big = frame(&[7u8; 20]);
    ch.write_inbound(ByteBuffer::copied_from(&big[..6]));
    if fail_fast {
        // reported as soon as the length is known
        assert!(ch.read_exception().is_some());
    } else {
        assert!(ch.read_exception().is_none());
    }
    ch.write_inbound(ByteBuffer::copied_from(&big[6..15]));
    let mut rest = big[15..].to_vec();
    rest.extend(frame(b"ok"));
    ch.write_inbound(ByteBuffer::copied_from(&rest));

    if !fail_fast {
        let err = ch.read_exception().unwrap();
        assert!(matches!(*err, KeelsonError::FrameTooLong { length: 22, max: 8 }));
    }
    assert!(ch.read_exception().is_none(), "exactly one FrameTooLong");
    assert_eq!(drain(&ch), [b"ok".to_vec()]);
}

#[test]
fn oversized_frame_reported_once_then_decoding_resumes() {
    oversized_then_small(true);
    oversized_then_small(false);
}

#[test]
fn oversized_line_is_discarded_up_to_the_next_delimiter() {
    let ch: EmbeddedChannel = EmbeddedChannel::new();
    let config = DelimiterConfig::lines(4).unwrap();
    ch.pipeline()
        .add_last("lines", DecoderHandler::new(DelimiterDecoder::new(config)))
        .unwrap();

    ch.write_inbound(ByteBuffer::copied_from(b"abcdefg"));
    let err = ch.read_exception().unwrap();
    assert!(matches!(*err, KeelsonError::FrameTooLong { max: 4, .. }));
    ch.write_inbound(ByteBuffer::copied_from(b"hij\r\nok\r\n"));

    assert!(ch.read_exception().is_none());
    assert_eq!(drain(&ch), [b"ok".to_vec()]);
}

/// Emits everything it has, but only once the stream has ended.
struct UntilClose;

impl ReplayingDecode for UntilClose {
    type State = ();
    type Output = ByteBuffer;

    fn decode(&mut self, cx: &mut ReplayContext<'_, ()>) -> Replay<Option<ByteBuffer>> {
        if !cx.is_terminated() || cx.available() == 0 {
            return Err(Interrupt::NeedMore);
        }
        let n = cx.available();
        Ok(Some(cx.read_slice(n)?))
    }
}

#[test]
fn final_pass_runs_before_inactive_moves_on() {
    let ch: EmbeddedChannel = EmbeddedChannel::new();
    ch.pipeline()
        .add_last("until-close", DecoderHandler::new(UntilClose))
        .unwrap();

    ch.write_inbound(ByteBuffer::copied_from(b"whole "));
    ch.write_inbound(ByteBuffer::copied_from(b"body"));
    assert_eq!(ch.inbound_len(), 0);

    assert!(ch.finish());
    assert_eq!(drain(&ch), [b"whole body".to_vec()]);
}

#[test]
fn removing_the_decoder_forwards_undecoded_bytes() {
    let ch: EmbeddedChannel = EmbeddedChannel::new();
    let config = LengthFieldConfig::new(64, 0, 2).unwrap();
    ch.pipeline()
        .add_last("frames", DecoderHandler::new(LengthFieldDecoder::new(config)))
        .unwrap();

    ch.write_inbound(ByteBuffer::copied_from(&[0, 9, b'p', b'a']));
    assert_eq!(ch.inbound_len(), 0);

    ch.pipeline().remove("frames").unwrap();
    ch.run_pending_tasks();
    assert_eq!(drain(&ch), [vec![0, 9, b'p', b'a']]);

    // later bytes go straight through
    ch.write_inbound(ByteBuffer::copied_from(b"rt"));
    assert_eq!(drain(&ch), [b"rt".to_vec()]);
}

#[test]
fn replies_flow_past_the_decoder_untouched() {
    let ch: EmbeddedChannel<ReplyMessage> = EmbeddedChannel::new();
    ch.pipeline()
        .add_last("replies", DecoderHandler::new(ReplyDecoder::default()))
        .unwrap();

    ch.write_inbound(ReplyMessage::Raw(ByteBuffer::copied_from(b"*2\r\n$3\r\nfoo\r\n:")));
    assert_eq!(ch.inbound_len(), 0);
    ch.write_inbound(ReplyMessage::Raw(ByteBuffer::copied_from(b"9\r\n")));
    // already decoded replies are passed on as they are
    ch.write_inbound(ReplyMessage::Reply(Reply::Integer(1)));

    match ch.read_inbound() {
        Some(ReplyMessage::Reply(Reply::MultiBulk(Some(items)))) => assert_eq!(
            items,
            [Reply::Bulk(Some(ByteBuffer::copied_from(b"foo"))), Reply::Integer(9)]
        ),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(ch.read_inbound(), Some(ReplyMessage::Reply(Reply::Integer(1)))));
}

#[test]
fn prepender_frames_outbound_buffers() {
    let ch: EmbeddedChannel = EmbeddedChannel::new();
    let prepender = LengthFieldPrepender::new(2).unwrap();
    ch.pipeline()
        .add_last("prepender", EncoderHandler::new(prepender))
        .unwrap();

    assert!(ch.write_outbound(ByteBuffer::copied_from(b"abc")).is_success());
    assert_eq!(ch.read_outbound().unwrap().readable_slice(), &[0, 3, b'a', b'b', b'c']);

    // buffers allocated by the channel carry a prepend reserve
    let mut payload = ch.channel().alloc_buffer(8);
    assert!(payload.prepend_space() >= 2);
    payload.write_slice(b"xy").unwrap();
    assert!(ch.write_outbound(payload).is_success());
    assert_eq!(ch.read_outbound().unwrap().readable_slice(), &[0, 2, b'x', b'y']);
}

#[test]
fn failed_encode_fails_the_write_and_fires_an_exception() {
    let ch: EmbeddedChannel = EmbeddedChannel::new();
    let prepender = LengthFieldPrepender::new(1).unwrap();
    ch.pipeline()
        .add_last("prepender", EncoderHandler::new(prepender))
        .unwrap();

    let write = ch.write_outbound(ByteBuffer::copied_from(&[0u8; 300]));
    assert!(write.is_failed());
    assert!(matches!(*write.cause().unwrap(), KeelsonError::CorruptedFrame(_)));
    assert!(ch.read_exception().is_some());
    assert_eq!(ch.outbound_len(), 0);
}

#[test]
fn decoder_and_encoder_in_one_pipeline() {
    struct Upper;

    impl ChannelHandler for Upper {
        fn channel_read(&mut self, ctx: &HandlerContext, msg: ByteBuffer) {
            let mut out = ctx.alloc_buffer(msg.readable_bytes());
            out.write_slice(&msg.readable_slice().to_ascii_uppercase()).unwrap();
            ctx.write_and_flush(out);
        }
    }

    let ch = EmbeddedChannel::with_handlers(vec![
        (
            "prepender",
            Box::new(EncoderHandler::<_, ByteBuffer>::new(LengthFieldPrepender::new(2).unwrap()))
                as Box<dyn ChannelHandler>,
        ),
        (
            "frames",
            Box::new(DecoderHandler::<_, ByteBuffer>::new(LengthFieldDecoder::new(
                LengthFieldConfig::new(64, 0, 2).unwrap().with_initial_bytes_to_strip(2),
            ))),
        ),
        ("upper", Box::new(Upper)),
    ])
    .unwrap();

    ch.write_inbound(ByteBuffer::copied_from(&frame(b"hi")[..3]));
    assert_eq!(ch.outbound_len(), 0);
    ch.write_inbound(ByteBuffer::copied_from(&frame(b"hi")[3..]));
    assert_eq!(ch.read_outbound().unwrap().readable_slice(), &[0, 2, b'H', b'I']);
}
