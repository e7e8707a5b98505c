//! Length-prefixed request/response over TCP
//!
//! Starts a server that reverses each frame, connects a client to it, sends
//! a few frames and prints the replies. Both sides use the same codec pair:
//! a 2-byte length-field decoder and a 2-byte length prepender.

use keelson::prelude::*;
use std::time::Duration;

fn install_codec(channel: &Channel) -> Result<()> {
    let pipeline = channel.pipeline();
    pipeline.add_last("prepender", EncoderHandler::new(LengthFieldPrepender::new(2)?))?;
    pipeline.add_last(
        "frames",
        DecoderHandler::new(LengthFieldDecoder::new(
            LengthFieldConfig::new(64 * 1024, 0, 2)?.with_initial_bytes_to_strip(2),
        )),
    )
}

struct Reverse;

impl ChannelHandler for Reverse {
    fn channel_read(&mut self, ctx: &HandlerContext, frame: ByteBuffer) {
        let mut reply = ctx.alloc_buffer(frame.readable_bytes());
        let reversed: Vec<u8> = frame.readable_slice().iter().rev().copied().collect();
        let _ = reply.write_slice(&reversed);
        ctx.write_and_flush(reply);
    }
}

struct Replies(flume::Sender<String>);

impl ChannelHandler for Replies {
    fn channel_read(&mut self, _ctx: &HandlerContext, frame: ByteBuffer) {
        let _ = self.0.send(String::from_utf8_lossy(frame.readable_slice()).into_owned());
    }
}

fn main() -> Result<()> {
    keelson::dev_tracing::init_tracing();

    let event_loop = EventLoop::new("framed-demo")?;
    let server: Channel = ServerBootstrap::new()
        .event_loop(&event_loop)
        .child_handler(|child| {
            install_codec(child)?;
            child.pipeline().add_last("reverse", Reverse)
        })
        .bind("127.0.0.1:0".parse().unwrap())
        .get()?;
    let addr = server
        .local_addr()
        .ok_or_else(|| KeelsonError::invalid_config("server has no local address"))?;
    println!("server on {addr}");

    let (tx, rx) = flume::unbounded();
    let client: Channel = Bootstrap::new()
        .event_loop(&event_loop)
        .options(ChannelOptions::default().with_connect_timeout(Duration::from_secs(2)))
        .handler(move |ch| {
            install_codec(ch)?;
            ch.pipeline().add_last("replies", Replies(tx.clone()))
        })
        .connect(addr)
        .get()?;

    for word in ["keelson", "pipeline", "replay"] {
        let mut frame = client.alloc_buffer(word.len());
        frame.write_slice(word.as_bytes())?;
        client.write_and_flush(frame);
    }
    for _ in 0..3 {
        match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(reply) => println!("reply: {reply}"),
            Err(e) => {
                println!("no reply: {e}");
                break;
            }
        }
    }

    client.close().wait()?;
    server.close().wait()?;
    event_loop.shutdown();
    Ok(())
}
