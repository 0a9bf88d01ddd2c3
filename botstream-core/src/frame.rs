//! Decoder for the chat api's line-oriented event protocol.
//!
//! ```text
//! event:conversation.message.delta
//! data:{"id":"...","content":"Hel"}
//!
//! ```
//! A frame is an `event:` line naming the kind followed by a `data:` line with its
//! JSON payload. Blank lines delimit frames and are skipped. If the very first
//! meaningful line is not an `event:` line, the body is an error object instead of
//! a stream and is decoded as such.

use tracing::{debug, warn};

use crate::error::{BotStreamError, CoreResult};
use crate::model::{ApiError, EventPayload};
use crate::stream::{EventKind, StreamEvent};

pub const PREFIX_EVENT: &str = "event:";
pub const PREFIX_DATA: &str = "data:";

/// Largest error body collected across lines before giving up on it.
const MAX_ERROR_BODY: usize = 64 * 1024;

/// Output of a completed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(StreamEvent),
    /// Terminal sentinel. Carries nothing for readers.
    Done,
}

/// Line-at-a-time frame decoder. Holds only the kind of the frame being built.
#[derive(Debug, Default)]
pub struct FrameParser {
    pending: Option<EventKind>,
    seen_event: bool,
    error_body: String,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once an `event:` line has been read, i.e. the body is a stream.
    pub fn is_streaming(&self) -> bool {
        self.seen_event
    }

    /// Feed one line (terminator already stripped). Returns a frame when the line completes one.
    pub fn feed(&mut self, line: &str) -> CoreResult<Option<Frame>> {
        if !self.error_body.is_empty() {
            return self.feed_error_body(line);
        }
        if line.trim().is_empty() || line.starts_with(':') {
            return Ok(None);
        }

        if let Some(kind) = line.strip_prefix(PREFIX_EVENT) {
            let kind = EventKind::from_wire(kind.trim());
            if let Some(prev) = self.pending.replace(kind) {
                warn!(kind = %prev, "event line without data, frame dropped");
            }
            self.seen_event = true;
            return Ok(None);
        }

        if !self.seen_event {
            return self.feed_error_body(line);
        }

        if let Some(data) = line.strip_prefix(PREFIX_DATA) {
            let Some(kind) = self.pending.take() else {
                debug!("data line without preceding event line, skipped");
                return Ok(None);
            };
            return decode_frame(kind, data.trim()).map(Some);
        }

        debug!(line = %truncate(line, 120), "unrecognized line, skipped");
        Ok(None)
    }

    /// Error object still being collected when the body ended, if any.
    pub fn finish(&mut self) -> Option<BotStreamError> {
        if self.error_body.is_empty() {
            return None;
        }
        Some(decode_error_body(&std::mem::take(&mut self.error_body)))
    }

    /// Collect a leading non-stream body until it forms a complete JSON value.
    fn feed_error_body(&mut self, line: &str) -> CoreResult<Option<Frame>> {
        self.error_body.push_str(line);
        self.error_body.push('\n');
        match serde_json::from_str::<serde_json::Value>(&self.error_body) {
            Err(e) if e.is_eof() && self.error_body.len() < MAX_ERROR_BODY => Ok(None),
            _ => Err(decode_error_body(&std::mem::take(&mut self.error_body))),
        }
    }
}

fn decode_frame(kind: EventKind, data: &str) -> CoreResult<Frame> {
    if kind == EventKind::Done {
        return Ok(Frame::Done);
    }
    if data.is_empty() {
        return Err(BotStreamError::Protocol(format!("empty data for {kind}")));
    }
    let payload = match &kind {
        EventKind::Other(name) => serde_json::from_str::<EventPayload>(data).unwrap_or_else(|e| {
            debug!(kind = %name, error = %e, "undecodable payload for unknown kind");
            EventPayload::default()
        }),
        _ => serde_json::from_str::<EventPayload>(data)
            .map_err(|e| BotStreamError::Protocol(format!("invalid {kind} payload: {e}")))?,
    };
    Ok(Frame::Event(StreamEvent::new(kind, payload)))
}

/// Interpret a non-stream body line as the server's error object.
pub fn decode_error_body(body: &str) -> BotStreamError {
    match serde_json::from_str::<ApiError>(body.trim()) {
        Ok(err) if err.code != 0 || !err.msg.is_empty() => err.into(),
        _ => BotStreamError::Protocol(format!(
            "expected event stream, got: {}",
            truncate(body, 300)
        )),
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        let mut t = s[..end].to_string();
        t.push_str("...");
        t
    } else {
        s.to_string()
    }
}
