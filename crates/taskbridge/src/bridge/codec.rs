//! Framed codec for coordinator connections.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization.
//! Every frame is a 4-byte big-endian length followed by that many bytes of
//! UTF-8 JSON. Works over any AsyncRead/AsyncWrite (TCP, pipes, duplex).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Default cap on a single frame body.
///
/// A peer announcing a larger frame is rejected from the length prefix alone,
/// before any of the body is buffered.
pub const MAX_FRAME_LENGTH: usize = 10 * 1024;

/// Build the raw frame codec used when the caller wants to parse bodies itself.
pub fn frame_codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_length)
        .new_codec()
}

/// Codec that frames messages with length prefix and serializes with JSON.
///
/// Wraps LengthDelimitedCodec and adds serde_json serialization.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    max_frame_length: usize,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            inner: frame_codec(max_frame_length),
            max_frame_length,
            _phantom: PhantomData,
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let json_len = json.len();
        if json_len > self.max_frame_length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "frame of {} bytes exceeds limit of {} bytes",
                    json_len, self.max_frame_length
                ),
            ));
        }
        tracing::trace!(json_size_bytes = json_len, "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}
