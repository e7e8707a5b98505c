#![no_main]

use keelson_codec::{
    DecodeEvent, DelimiterConfig, DelimiterDecoder, LengthFieldConfig, LengthFieldDecoder, ReplayingDecode,
    ReplayingDecoder, ReplyDecoder,
};
use keelson_core::buffer::ByteBuffer;
use libfuzzer_sys::fuzz_target;

// The first byte picks the chunk size, the rest is the stream.
fuzz_target!(|data: &[u8]| {
    let Some((&chunk, stream)) = data.split_first() else {
        return;
    };
    let chunk = usize::from(chunk).max(1);

    if let Ok(config) = LengthFieldConfig::new(4096, 1, 2) {
        let stripped = config.clone().with_length_adjustment(-1).with_initial_bytes_to_strip(3);
        drive(LengthFieldDecoder::new(stripped), stream, chunk);
        drive(LengthFieldDecoder::new(config.with_fail_fast(false)), stream, chunk);
    }
    if let Ok(config) = DelimiterConfig::lines(256) {
        drive(DelimiterDecoder::new(config), stream, chunk);
    }
    if let Ok(config) = DelimiterConfig::nul(256) {
        drive(DelimiterDecoder::new(config.with_strip_delimiter(false).with_fail_fast(false)), stream, chunk);
    }
    drive(ReplyDecoder::new(1024, 256), stream, chunk);
});

fn drive<D: ReplayingDecode>(decoder: D, stream: &[u8], chunk: usize) {
    let mut driver = ReplayingDecoder::new(decoder);
    let mut fed = 0usize;
    for piece in stream.chunks(chunk) {
        fed += piece.len();
        for event in driver.feed(ByteBuffer::copied_from(piece)) {
            if let DecodeEvent::Error(err) = event {
                let _ = err.to_string();
            }
        }
        assert!(driver.consumed() as usize + driver.buffered() <= fed);
    }
    let _ = driver.finish();
    assert!(driver.is_finished());
}
