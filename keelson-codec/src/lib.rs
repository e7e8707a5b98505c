//! # Keelson Codec
//!
//! Framing and protocol decoding for keelson pipelines.
//!
//! ## Overview
//!
//! - **Replaying decoders**: write a parser as if every byte were already
//!   there; the driver rewinds and retries when the input runs short
//! - **Length-field framing**: 1/2/4/8 byte length headers, either byte order
//! - **Delimiter framing**: any set of delimiters, with line presets
//! - **Encoders**: the length-field prepender and a pipeline adapter
//! - **Reply decoder**: Redis-style replies, the reference replaying decoder
//!
//! Every decoder is sans-IO. [`ReplayingDecoder`] drives one directly from
//! bytes, [`DecoderHandler`] runs it inside a channel pipeline.
//!
//! ```rust
//! use keelson_codec::prelude::*;
//! use keelson_core::prelude::*;
//!
//! let config = LengthFieldConfig::new(1024, 0, 2)?.with_initial_bytes_to_strip(2);
//! let ch: EmbeddedChannel = EmbeddedChannel::new();
//! ch.pipeline().add_last("frames", DecoderHandler::new(LengthFieldDecoder::new(config)))?;
//!
//! ch.write_inbound(ByteBuffer::copied_from(&[0, 3, b'a']));
//! assert!(ch.read_inbound().is_none());
//! ch.write_inbound(ByteBuffer::copied_from(b"bc"));
//! assert_eq!(ch.read_inbound().unwrap().readable_slice(), b"abc");
//! # Ok::<(), KeelsonError>(())
//! ```

// Allow some pedantic lints
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]

pub mod delimiter;
pub mod encoder;
pub mod length_field;
pub mod replay;
pub mod resp;

pub use delimiter::{DelimiterConfig, DelimiterDecoder};
pub use encoder::{Encode, EncoderHandler, LengthFieldPrepender};
pub use length_field::{LengthFieldConfig, LengthFieldDecoder};
pub use replay::{DecodeEvent, DecoderHandler, Interrupt, Replay, ReplayContext, ReplayingDecode, ReplayingDecoder};
pub use resp::{Reply, ReplyDecoder, ReplyMessage};

/// Prelude module for convenient imports
///
/// ```rust
/// use keelson_codec::prelude::*;
/// ```
pub mod prelude {
    pub use super::replay::fail;
    pub use super::{
        DecodeEvent, DecoderHandler, DelimiterConfig, DelimiterDecoder, Encode, EncoderHandler, Interrupt,
        LengthFieldConfig, LengthFieldDecoder, LengthFieldPrepender, Replay, ReplayContext, ReplayingDecode,
        ReplayingDecoder, Reply, ReplyDecoder, ReplyMessage,
    };
}
