//! Codecs, idle detection and clients over real sockets.

use keelson::prelude::*;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

/// Answers each decoded frame with its length as text plus a newline.
struct LengthOf;

impl ChannelHandler for LengthOf {
    fn channel_read(&mut self, ctx: &HandlerContext, frame: ByteBuffer) {
        let mut reply = ctx.alloc_buffer(8);
        let _ = reply.write_slice(format!("{}\n", frame.readable_bytes()).as_bytes());
        ctx.write_and_flush(reply);
    }
}

fn read_line(stream: &mut TcpStream) -> String {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).unwrap();
        if byte[0] == b'\n' {
            return String::from_utf8(out).unwrap();
        }
        out.push(byte[0]);
    }
}

#[test]
fn fragmented_lines_are_reassembled_by_the_server() {
    let event_loop = EventLoop::new("e2e-lines").unwrap();
    let server: Channel = ServerBootstrap::new()
        .event_loop(&event_loop)
        .child_handler(|child| {
            let pipeline = child.pipeline();
            pipeline.add_last(
                "lines",
                DecoderHandler::new(DelimiterDecoder::new(DelimiterConfig::lines(64)?)),
            )?;
            pipeline.add_last("length", LengthOf)
        })
        .bind("127.0.0.1:0".parse().unwrap())
        .get()
        .unwrap();

    let mut stream = TcpStream::connect(server.local_addr().unwrap()).unwrap();
    stream.set_nodelay(true).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();

    for piece in [&b"hel"[..], b"lo\r", b"\nsecond line\n", b"x"] {
        stream.write_all(piece).unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(read_line(&mut stream), "5");
    assert_eq!(read_line(&mut stream), "11");

    stream.write_all(b"yz\r\n").unwrap();
    assert_eq!(read_line(&mut stream), "3");

    server.close().wait().unwrap();
    event_loop.shutdown();
}

fn framed(channel: &Channel) -> Result<()> {
    let pipeline = channel.pipeline();
    pipeline.add_last("prepender", EncoderHandler::new(LengthFieldPrepender::new(4)?))?;
    pipeline.add_last(
        "frames",
        DecoderHandler::new(LengthFieldDecoder::new(
            LengthFieldConfig::new(1 << 20, 0, 4)?.with_initial_bytes_to_strip(4),
        )),
    )
}

struct EchoFrames;

impl ChannelHandler for EchoFrames {
    fn channel_read(&mut self, ctx: &HandlerContext, frame: ByteBuffer) {
        ctx.write_and_flush(frame);
    }
}

struct Collect(flume::Sender<ByteBuffer>);

impl ChannelHandler for Collect {
    fn channel_read(&mut self, _ctx: &HandlerContext, frame: ByteBuffer) {
        let _ = self.0.send(frame);
    }
}

#[test]
fn length_framed_client_and_server() {
    let group = EventLoopGroup::with_threads(2).unwrap();
    let server: Channel = ServerBootstrap::new()
        .group(&group)
        .child_handler(|child| {
            framed(child)?;
            child.pipeline().add_last("echo", EchoFrames)
        })
        .bind("127.0.0.1:0".parse().unwrap())
        .get()
        .unwrap();

    let (tx, rx) = flume::unbounded();
    let client: Channel = Bootstrap::new()
        .group(&group)
        .handler(move |ch| {
            framed(ch)?;
            ch.pipeline().add_last("collect", Collect(tx.clone()))
        })
        .connect(server.local_addr().unwrap())
        .get()
        .unwrap();

    // large enough to arrive in several reads
    let big = vec![0xC3u8; 200_000];
    let payloads: Vec<Vec<u8>> = vec![b"one".to_vec(), Vec::new(), big, b"last".to_vec()];
    for payload in &payloads {
        let written = client.write_and_flush(ByteBuffer::copied_from(payload));
        assert!(written.wait_timeout(WAIT).unwrap());
        assert!(written.is_success());
    }
    for payload in &payloads {
        let frame = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(frame.readable_slice(), &payload[..]);
    }

    client.close().wait().unwrap();
    server.close().wait().unwrap();
    group.shutdown();
}

struct CloseWhenIdle;

impl ChannelHandler for CloseWhenIdle {
    fn user_event(&mut self, ctx: &HandlerContext, event: UserEvent) {
        if let UserEvent::Idle(IdleStateEvent { state: IdleState::ReaderIdle, .. }) = event {
            ctx.close();
        }
    }
}

#[test]
fn silent_peers_are_dropped_by_the_idle_handler() {
    let event_loop = EventLoop::new("e2e-idle").unwrap();
    let server: Channel = ServerBootstrap::new()
        .event_loop(&event_loop)
        .child_handler(|child| {
            let pipeline = child.pipeline();
            pipeline.add_last(
                "idle",
                IdleStateHandler::new(Some(Duration::from_millis(100)), None, None)?,
            )?;
            pipeline.add_last("close-when-idle", CloseWhenIdle)
        })
        .bind("127.0.0.1:0".parse().unwrap())
        .get()
        .unwrap();

    let mut stream = TcpStream::connect(server.local_addr().unwrap()).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    let mut buf = [0u8; 1];
    assert!(matches!(stream.read(&mut buf), Ok(0) | Err(_)));

    server.close().wait().unwrap();
    event_loop.shutdown();
}

#[test]
fn replies_decoded_from_a_socket() {
    let event_loop = EventLoop::new("e2e-replies").unwrap();
    let (tx, rx) = flume::unbounded();

    struct Forward(flume::Sender<Reply>);

    impl ChannelHandler<ReplyMessage> for Forward {
        fn channel_read(&mut self, _ctx: &HandlerContext<ReplyMessage>, msg: ReplyMessage) {
            if let ReplyMessage::Reply(reply) = msg {
                let _ = self.0.send(reply);
            }
        }
    }

    let server: Channel<ReplyMessage> = ServerBootstrap::new()
        .event_loop(&event_loop)
        .child_handler(move |child| {
            let pipeline = child.pipeline();
            pipeline.add_last("replies", DecoderHandler::new(ReplyDecoder::default()))?;
            pipeline.add_last("forward", Forward(tx.clone()))
        })
        .bind("127.0.0.1:0".parse().unwrap())
        .get()
        .unwrap();

    let mut stream = TcpStream::connect(server.local_addr().unwrap()).unwrap();
    stream.write_all(b"*2\r\n$4\r\nPI").unwrap();
    std::thread::sleep(Duration::from_millis(20));
    stream.write_all(b"NG\r\n:42\r\n+OK\r\n").unwrap();

    assert_eq!(
        rx.recv_timeout(WAIT).unwrap(),
        Reply::MultiBulk(Some(vec![
            Reply::Bulk(Some(ByteBuffer::copied_from(b"PING"))),
            Reply::Integer(42),
        ]))
    );
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Reply::Status("OK".into()));

    server.close().wait().unwrap();
    event_loop.shutdown();
}
