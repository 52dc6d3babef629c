//! Newline-delimited JSON framing.
//!
//! One frame per line. A frame that exceeds [`MAX_FRAME_LENGTH`] is skipped
//! (logged and discarded) rather than killing the connection; a frame that
//! fails to parse surfaces as a codec error so the session loop can decide
//! whether to drop the peer.

use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Maximum frame length in bytes, terminator included. Network maps for
/// large accounts are the biggest frames; this leaves generous headroom.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame exceeds maximum length ({MAX_FRAME_LENGTH} bytes)")]
    FrameTooLong,
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Frames a byte stream into `Rx` messages and serializes `Tx` messages,
/// one JSON document per `\n`-terminated line.
///
/// The two type parameters let one codec value serve either side of an
/// asymmetric conversation (requests out, responses in, or vice versa).
#[derive(Debug)]
pub struct FrameCodec<Tx, Rx> {
    /// True while discarding the tail of an oversized frame.
    skipping: bool,
    _marker: PhantomData<(Tx, Rx)>,
}

impl<Tx, Rx> Default for FrameCodec<Tx, Rx> {
    fn default() -> Self {
        FrameCodec { skipping: false, _marker: PhantomData }
    }
}

impl<Tx, Rx> FrameCodec<Tx, Rx> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<Tx: Serialize, Rx> Encoder<Tx> for FrameCodec<Tx, Rx> {
    type Error = CodecError;

    fn encode(&mut self, item: Tx, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

impl<Tx, Rx: DeserializeOwned> Decoder for FrameCodec<Tx, Rx> {
    type Item = Rx;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.skipping {
                match src.iter().position(|&b| b == b'\n') {
                    Some(pos) => {
                        warn!(bytes = pos + 1, "codec: dropped oversized frame tail");
                        src.advance(pos + 1);
                        self.skipping = false;
                    }
                    None => {
                        src.clear();
                        return Ok(None);
                    }
                }
            }

            match src.iter().position(|&b| b == b'\n') {
                Some(pos) if pos > MAX_FRAME_LENGTH => {
                    warn!(bytes = pos, "codec: skipped oversized frame");
                    src.advance(pos + 1);
                    continue;
                }
                Some(pos) => {
                    let line = src.split_to(pos + 1);
                    let trimmed = &line[..pos];
                    // Bare keepalive newlines are ignored.
                    if trimmed.iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }
                    return Ok(Some(serde_json::from_slice(trimmed)?));
                }
                None if src.len() > MAX_FRAME_LENGTH => {
                    // No terminator yet and the buffer is already too big:
                    // enter skip mode so the connection survives.
                    src.clear();
                    self.skipping = true;
                    return Ok(None);
                }
                None => return Ok(None),
            }
        }
    }
}
