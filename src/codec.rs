use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::StompError;
use crate::frame::{Command, ServerFrame, COLON, LINE_FEED, NULL};
use crate::parser::parse_frame_bytes;

/// Items produced by the decoder: a full server frame, or a single LF
/// heart-beat pulse (which also covers the padding line feed a broker may
/// emit between frames).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerItem {
    Frame(ServerFrame),
    Heartbeat,
}

/// `StompCodec` implements `tokio_util::codec::{Decoder, Encoder}` for the
/// STOMP wire grammar.
///
/// Encoding is deterministic: standard headers are written in the canonical
/// order fixed by [`crate::frame::Headers`], then user-defined headers in
/// insertion order. Decoding is incremental; a malformed frame consumes its
/// bytes up to and including the terminating NUL, so the caller can report
/// the error and keep decoding the stream.
#[derive(Debug)]
pub struct StompCodec {
    // Stateless; frames are parsed directly out of the caller's buffer.
}

impl StompCodec {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for StompCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for StompCodec {
    type Item = ServerItem;
    type Error = StompError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.chunk().first() {
            // A lone LF is a heart-beat pulse (or inter-frame padding); a
            // lone NUL is an empty frame boundary, seen from peers that
            // terminate their pulses with NUL. Both are consumed silently.
            Some(&LINE_FEED) | Some(&NULL) => {
                src.advance(1);
                return Ok(Some(ServerItem::Heartbeat));
            }
            _ => {}
        }
        let nul = match src.chunk().iter().position(|&b| b == NULL) {
            Some(i) => i,
            None => return Ok(None),
        };
        let raw = src.split_to(nul + 1);
        let frame = parse_frame_bytes(&raw[..nul])?;
        Ok(Some(ServerItem::Frame(frame)))
    }
}

impl Encoder<Command> for StompCodec {
    type Error = StompError;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if let Command::Pulse = command {
            dst.put_u8(LINE_FEED);
            return Ok(());
        }

        let headers = command.headers();
        let body = command.body();
        if headers.content_length.is_none() && body.contains(&NULL) {
            return Err(StompError::InvalidArgument(
                "body contains NUL but no content-length is set".to_owned(),
            ));
        }

        dst.extend_from_slice(command.name().as_bytes());
        dst.put_u8(LINE_FEED);
        for (name, value) in headers.standard() {
            dst.extend_from_slice(name.as_bytes());
            dst.put_u8(COLON);
            dst.extend_from_slice(value.as_bytes());
            dst.put_u8(LINE_FEED);
        }
        for (name, value) in &headers.user_defined {
            dst.extend_from_slice(name.as_bytes());
            dst.put_u8(COLON);
            dst.extend_from_slice(value.as_bytes());
            dst.put_u8(LINE_FEED);
        }
        dst.put_u8(LINE_FEED);
        dst.extend_from_slice(body);
        dst.put_u8(LINE_FEED);
        dst.put_u8(NULL);
        Ok(())
    }
}
