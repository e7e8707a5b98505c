//! Line echo server
//!
//! Echoes every `\n` or `\r\n` terminated line back, upper-cased, and drops
//! connections that stay silent for 30 seconds.
//!
//! ```text
//! cargo run --example line_echo_server -- --port 7000
//! nc 127.0.0.1 7000
//! ```

use keelson::prelude::*;
use std::env;
use std::time::Duration;
use tracing::{info, Level};

struct Shout;

impl ChannelHandler for Shout {
    fn channel_read(&mut self, ctx: &HandlerContext, line: ByteBuffer) {
        let mut reply = ctx.alloc_buffer(line.readable_bytes() + 1);
        let _ = reply.write_slice(&line.readable_slice().to_ascii_uppercase());
        let _ = reply.write_u8(b'\n');
        ctx.write(reply);
    }

    fn channel_read_complete(&mut self, ctx: &HandlerContext) {
        ctx.flush();
    }

    fn user_event(&mut self, ctx: &HandlerContext, event: UserEvent) {
        if let UserEvent::Idle(IdleStateEvent { state: IdleState::ReaderIdle, .. }) = event {
            info!(handler = ctx.name(), "reader idle, closing");
            ctx.close();
        }
    }

    fn exception_caught(&mut self, ctx: &HandlerContext, err: std::sync::Arc<KeelsonError>) {
        // an overlong line is not fatal; tell the peer and carry on
        if matches!(*err, KeelsonError::FrameTooLong { .. }) {
            ctx.write_and_flush(ByteBuffer::copied_from(b"ERR line too long\n"));
        } else {
            ctx.close();
        }
    }
}

fn main() -> Result<()> {
    keelson::dev_tracing::init_tracing();

    let args: Vec<String> = env::args().collect();
    let port = if args.len() > 2 && args[1] == "--port" {
        args[2].parse::<u16>().map_err(|e| KeelsonError::invalid_config(e.to_string()))?
    } else {
        7000
    };

    let group = EventLoopGroup::with_threads(2)?;
    let server: Channel = ServerBootstrap::new()
        .group(&group)
        .child_options(ChannelOptions::default().with_read_buffer_size(4096))
        .child_handler(|child| {
            let pipeline = child.pipeline();
            pipeline.add_last("log", LoggingHandler::new(Level::DEBUG))?;
            pipeline.add_last(
                "idle",
                IdleStateHandler::new(Some(Duration::from_secs(30)), None, None)?,
            )?;
            pipeline.add_last(
                "lines",
                DecoderHandler::new(DelimiterDecoder::new(DelimiterConfig::lines(1024)?)),
            )?;
            pipeline.add_last("shout", Shout)
        })
        .bind(([127, 0, 0, 1], port).into())
        .get()?;

    println!("line echo server listening on {}", server.local_addr().map_or_else(String::new, |a| a.to_string()));
    server.close_future().wait()?;
    group.shutdown();
    Ok(())
}
