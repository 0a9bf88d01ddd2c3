//! Streaming primitives exposed by botstream.
//!
//! Contract:
//! - A turn emits one `ChatInProgress`, then 0..n message events, then exactly one
//!   terminal event: `ChatCompleted` or `ChatFailed`.
//! - The wire-level `done` sentinel is never delivered to readers; it only closes the log.
//! - Events are immutable once appended and are shared between readers via `Arc`.

use std::fmt;
use std::sync::Arc;

use crate::model::EventPayload;

pub const CHAT_IN_PROGRESS: &str = "conversation.chat.in_progress";
pub const CHAT_COMPLETED: &str = "conversation.chat.completed";
pub const CHAT_FAILED: &str = "conversation.chat.failed";
pub const MESSAGE_DELTA: &str = "conversation.message.delta";
pub const MESSAGE_COMPLETED: &str = "conversation.message.completed";
pub const EVENT_DONE: &str = "done";

/// Event kind named by an `event:` line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    ChatInProgress,
    ChatCompleted,
    ChatFailed,
    MessageDelta,
    MessageCompleted,
    /// Terminal sentinel; closes the stream.
    Done,
    /// Any kind this client does not interpret. Kept so readers can still see it.
    Other(String),
}

impl EventKind {
    pub fn from_wire(s: &str) -> Self {
        match s {
            CHAT_IN_PROGRESS => Self::ChatInProgress,
            CHAT_COMPLETED => Self::ChatCompleted,
            CHAT_FAILED => Self::ChatFailed,
            MESSAGE_DELTA => Self::MessageDelta,
            MESSAGE_COMPLETED => Self::MessageCompleted,
            EVENT_DONE => Self::Done,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::ChatInProgress => CHAT_IN_PROGRESS,
            Self::ChatCompleted => CHAT_COMPLETED,
            Self::ChatFailed => CHAT_FAILED,
            Self::MessageDelta => MESSAGE_DELTA,
            Self::MessageCompleted => MESSAGE_COMPLETED,
            Self::Done => EVENT_DONE,
            Self::Other(s) => s,
        }
    }

    /// Returns true if no further events follow this one on the wire.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::ChatFailed)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded frame. Identity is its position in the event log.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub kind: EventKind,
    pub payload: EventPayload,
}

impl StreamEvent {
    pub fn new(kind: EventKind, payload: EventPayload) -> Self {
        Self { kind, payload }
    }

    /// Convenience accessor for `MessageDelta` contents.
    pub fn as_text_delta(&self) -> Option<&str> {
        match self.kind {
            EventKind::MessageDelta => self.payload.content.as_deref(),
            _ => None,
        }
    }
}

/// Boxed replay of a turn's events. Each call that produces one starts at the first event.
pub type BoxEventStream = futures::stream::BoxStream<'static, Arc<StreamEvent>>;
