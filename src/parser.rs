//! Inbound frame grammar: `COMMAND LF (NAME ":" VALUE LF)* LF BODY NUL`.
//!
//! Frames are delimited purely on NUL; a `content-length` header is carried
//! through for the caller but does not influence framing. Header values are
//! raw bytes — no `\c`-style unescaping is applied.

use std::collections::hash_map::Entry;

use crate::error::{Result, StompError};
use crate::frame::{ServerFrame, COLON, LINE_FEED, NULL};

/// Parse the contents of one frame, `raw` being everything up to but not
/// including the terminating NUL.
pub(crate) fn parse_frame_bytes(raw: &[u8]) -> Result<ServerFrame> {
    let cmd_end = raw
        .iter()
        .position(|&b| b == LINE_FEED)
        .filter(|&i| i > 0)
        .ok_or_else(|| StompError::MalformedFrame("no command line".to_owned()))?;
    let command = String::from_utf8_lossy(&raw[..cmd_end]).into_owned();

    let mut frame = ServerFrame::new(command);
    let mut pos = cmd_end + 1;

    loop {
        if pos >= raw.len() {
            return Err(StompError::MalformedFrame("truncated header block".to_owned()));
        }
        if raw[pos] == LINE_FEED {
            pos += 1;
            break;
        }
        let line_end = raw[pos..]
            .iter()
            .position(|&b| b == LINE_FEED)
            .map(|i| pos + i)
            .ok_or_else(|| StompError::MalformedFrame("truncated header line".to_owned()))?;
        let line = &raw[pos..line_end];
        let colon = line.iter().position(|&b| b == COLON).ok_or_else(|| {
            StompError::MalformedFrame(format!(
                "header line missing ':': {:?}",
                String::from_utf8_lossy(line)
            ))
        })?;
        let name = String::from_utf8_lossy(&line[..colon]).into_owned();
        // First occurrence of a key wins; later duplicates are discarded.
        if let Entry::Vacant(slot) = frame.headers.entry(name) {
            slot.insert(line[colon + 1..].to_vec());
        }
        pos = line_end + 1;
    }

    frame.body = raw[pos..].to_vec();
    Ok(frame)
}

/// Parse a complete reply buffer into a [`ServerFrame`].
///
/// Leading line feeds (heart-beat pulses or inter-frame padding) are
/// skipped. The frame ends at the first NUL; if the buffer carries no NUL,
/// the whole buffer is taken as one frame.
pub fn parse_response(input: &[u8]) -> Result<ServerFrame> {
    let start = input
        .iter()
        .position(|&b| b != LINE_FEED)
        .unwrap_or(input.len());
    let input = &input[start..];
    match input.iter().position(|&b| b == NULL) {
        Some(nul) => parse_frame_bytes(&input[..nul]),
        None => parse_frame_bytes(input),
    }
}
