//! Framed codec for the bridge channel.
//!
//! Uses AnyDelimiterCodec for framing + serde_json for serialization: one JSON
//! object per `\n`-terminated line. Works over any AsyncRead/AsyncWrite (pipes,
//! sockets, in-memory duplex streams).
//!
//! Lines are parsed from raw bytes, so a line that is not valid UTF-8 is just
//! another malformed frame.

use std::io;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder};

use super::event::Event;

/// Default upper bound on a single frame.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// One decoded line.
///
/// A line that is not a valid event is reported per frame instead of failing the
/// stream, so one malformed message from the peer does not end the session.
pub type InboundFrame = Result<Event, serde_json::Error>;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame exceeds maximum length of {max} bytes")]
    FrameTooLong { max: usize },
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// Codec that frames events as newline-delimited JSON.
pub struct EventCodec {
    inner: AnyDelimiterCodec,
    max_length: usize,
}

impl Default for EventCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EventCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(
                b"\n".to_vec(),
                b"\n".to_vec(),
                max_length,
            ),
            max_length,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    fn map_inner_error(&self, err: AnyDelimiterCodecError) -> CodecError {
        match err {
            AnyDelimiterCodecError::MaxChunkLengthExceeded => CodecError::FrameTooLong {
                max: self.max_length,
            },
            AnyDelimiterCodecError::Io(e) => CodecError::Io(e),
        }
    }

    fn parse(line: Bytes) -> Option<InboundFrame> {
        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            return None;
        }
        tracing::trace!(frame_size_bytes = trimmed.len(), "Decoding frame");
        Some(serde_json::from_slice(trimmed))
    }
}

impl Decoder for EventCodec {
    type Item = InboundFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode(src) {
                Ok(Some(line)) => {
                    if let Some(frame) = Self::parse(line) {
                        return Ok(Some(frame));
                    }
                }
                Ok(None) => return Ok(None),
                Err(e) => return Err(self.map_inner_error(e)),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode_eof(src) {
                Ok(Some(line)) => {
                    if let Some(frame) = Self::parse(line) {
                        return Ok(Some(frame));
                    }
                }
                Ok(None) => return Ok(None),
                Err(e) => return Err(self.map_inner_error(e)),
            }
        }
    }
}

impl Encoder<Event> for EventCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Event, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)?;
        if json.len() > self.max_length {
            return Err(CodecError::FrameTooLong {
                max: self.max_length,
            });
        }
        tracing::trace!(event = %item.name, json_size_bytes = json.len(), "Encoding frame");
        self.inner
            .encode(json, dst)
            .map_err(|e| self.map_inner_error(e))
    }
}
