//! Decoding a reply stream in arbitrary chunks
//!
//! Feeds a recorded Redis-style reply stream to the replaying reply decoder
//! in small, uneven pieces and prints what comes out and where the decoder
//! stood after each piece. No sockets involved.

use keelson::prelude::*;

const STREAM: &[u8] = b"+OK\r\n:1000\r\n$5\r\nhello\r\n*3\r\n$3\r\nfoo\r\n$-1\r\n:7\r\n-ERR wrong type\r\n$40\r\n0123456789012345678901234567890123456789\r\n+PONG\r\n";

fn main() {
    keelson::dev_tracing::init_tracing();

    // bulk strings over 32 bytes are skipped
    let mut decoder = ReplayingDecoder::new(ReplyDecoder::new(32, 1024));

    let mut rest = STREAM;
    let mut piece = 1;
    while !rest.is_empty() {
        let n = piece.min(rest.len());
        let (chunk, tail) = rest.split_at(n);
        rest = tail;
        piece = piece % 7 + 3;

        for event in decoder.feed(ByteBuffer::copied_from(chunk)) {
            match event {
                DecodeEvent::Message(reply) => println!("reply     {reply:?}"),
                DecodeEvent::Error(err) => println!("error     {err}"),
            }
        }
        println!(
            "  fed {n:>2} bytes: state {:?}, {} buffered, {} consumed",
            decoder.state(),
            decoder.buffered(),
            decoder.consumed()
        );
    }

    for event in decoder.finish() {
        println!("at end    {event:?}");
    }
}
