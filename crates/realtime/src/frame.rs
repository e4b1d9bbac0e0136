//! Wire framing.
//!
//! Normal frames are `data: <json>\n\n`. The turn ends with `data: [DONE]\n\n`.
//! Keep-alive traffic is bare JSON with no prefix.

use crate::error::FrameError;
use chatrelay_core::StreamChunk;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub const FRAME_PREFIX: &str = "data:";
pub const DONE_SENTINEL: &str = "[DONE]";
const FRAME_SEPARATOR: &str = "\n\n";

/// Bare keep-alive messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KeepAlive {
    Ping { timestamp: i64 },
    Pong { timestamp: i64 },
}

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(StreamChunk),
    /// The turn-complete sentinel.
    Done,
    KeepAlive(KeepAlive),
}

/// Splits one socket message into frames and decodes each of them.
///
/// Pieces that are neither prefixed frames nor keep-alive messages are logged
/// and skipped.
pub fn parse_message(raw: &str) -> Vec<Result<Frame, FrameError>> {
    let pieces: Vec<&str> = raw
        .split(FRAME_SEPARATOR)
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .collect();

    if pieces.is_empty() {
        return vec![Err(FrameError::Empty)];
    }

    pieces
        .into_iter()
        .filter_map(|piece| parse_frame(piece).transpose())
        .collect()
}

/// Decodes a single frame. `Ok(None)` means the piece was ignored.
pub fn parse_frame(piece: &str) -> Result<Option<Frame>, FrameError> {
    let piece = piece.trim();
    let Some(payload) = piece.strip_prefix(FRAME_PREFIX) else {
        return Ok(parse_unframed(piece));
    };

    let payload = payload.trim();
    if payload.is_empty() {
        return Err(FrameError::Empty);
    }
    if payload == DONE_SENTINEL {
        return Ok(Some(Frame::Done));
    }

    let value: Value =
        serde_json::from_str(payload).map_err(|e| FrameError::Json(e.to_string()))?;
    if !value.is_object() {
        return Err(FrameError::NotAnObject);
    }
    StreamChunk::from_value(value)
        .map(|chunk| Some(Frame::Event(chunk)))
        .map_err(|e| FrameError::Event(e.to_string()))
}

fn parse_unframed(piece: &str) -> Option<Frame> {
    match serde_json::from_str::<KeepAlive>(piece) {
        Ok(keep_alive) => Some(Frame::KeepAlive(keep_alive)),
        Err(_) => {
            warn!(
                preview = %&piece[..floor_char_boundary(piece, 200)],
                "ignoring message without frame prefix"
            );
            None
        }
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Frames a serialized JSON payload.
pub fn encode_frame(json: &str) -> String {
    format!("{FRAME_PREFIX} {json}{FRAME_SEPARATOR}")
}

/// Serializes and frames any event.
pub fn encode_event<T: Serialize>(event: &T) -> Result<String, serde_json::Error> {
    Ok(encode_frame(&serde_json::to_string(event)?))
}

/// The turn-complete sentinel frame.
pub fn encode_done() -> String {
    encode_frame(DONE_SENTINEL)
}
