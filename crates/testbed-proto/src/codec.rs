//! Frame codec: one length-delimited JSON envelope per frame.

use crate::error::Result;
use crate::message::Message;
use bytes::Bytes;
use tokio_util::codec::LengthDelimitedCodec;

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Codec used on both directions of every channel.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn encode(message: &Message) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

pub fn decode(frame: &[u8]) -> Result<Message> {
    Ok(serde_json::from_slice(frame)?)
}
