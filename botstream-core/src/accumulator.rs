//! Folds a turn's event sequence into a `ChatResult`.
//!
//! | kind                          | effect                            |
//! |-------------------------------|-----------------------------------|
//! | chat in progress              | conversation id, chat id          |
//! | message delta (answer)        | append to answer                  |
//! | message completed (answer)    | replace answer                    |
//! | message completed (follow up) | push follow up                    |
//! | chat completed                | usage, completed at               |
//! | chat failed                   | last error                        |
//!
//! Everything else is ignored. Folding never fails; errors are data in `last_error`.

use std::future::Future;

use crate::buffer::{CursorStep, ReplayCursor};
use crate::model::{ChatResult, MessageType};
use crate::stream::{EventKind, StreamEvent};

#[derive(Debug, Default)]
pub struct ResultAccumulator {
    result: ChatResult,
}

impl ResultAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, ev: &StreamEvent) {
        let p = &ev.payload;
        let res = &mut self.result;
        match ev.kind {
            EventKind::ChatInProgress => {
                if let Some(conv) = &p.conversation_id {
                    res.conversation_id = Some(conv.clone());
                }
                if let Some(id) = &p.id {
                    res.chat_id = Some(id.clone());
                }
            }
            EventKind::MessageDelta => {
                // deltas without a type tag belong to the answer
                if matches!(p.kind, None | Some(MessageType::Answer))
                    && let Some(text) = &p.content
                {
                    res.answer.push_str(text);
                }
            }
            EventKind::MessageCompleted => match p.kind {
                Some(MessageType::Answer) => {
                    res.answer = p.content.clone().unwrap_or_default();
                }
                Some(MessageType::FollowUp) => {
                    if let Some(text) = &p.content {
                        res.follow_up.push(text.clone());
                    }
                }
                _ => {}
            },
            EventKind::ChatCompleted => {
                res.usage = p.usage;
                res.completed_at = p.completed_at;
            }
            EventKind::ChatFailed => {
                res.last_error = p.last_error.clone();
            }
            EventKind::Done | EventKind::Other(_) => {}
        }
    }

    pub fn snapshot(&self) -> &ChatResult {
        &self.result
    }

    pub fn finish(self) -> ChatResult {
        self.result
    }
}

/// Fold an in-memory sequence.
pub fn fold_events<'a, I>(events: I) -> ChatResult
where
    I: IntoIterator<Item = &'a StreamEvent>,
{
    let mut acc = ResultAccumulator::new();
    for ev in events {
        acc.apply(ev);
    }
    acc.finish()
}

/// Drive `cursor` to the end of the log, or until `cancel` resolves, and return
/// what was folded so far. Cancelling only stops this reader.
pub async fn accumulate<F>(mut cursor: ReplayCursor, cancel: F) -> ChatResult
where
    F: Future<Output = ()>,
{
    let mut acc = ResultAccumulator::new();
    tokio::pin!(cancel);
    loop {
        match cursor.next_until(cancel.as_mut()).await {
            CursorStep::Event(ev) => acc.apply(&ev),
            CursorStep::End => break,
            CursorStep::Cancelled => {
                tracing::debug!(position = cursor.position(), "fold cancelled");
                break;
            }
        }
    }
    acc.finish()
}
