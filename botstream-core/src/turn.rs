//! Caller-facing handle for one chat turn.
//!
//! Streaming and non-streaming turns look the same from here: an accepted
//! payload plus an event log that any number of readers can replay.

use std::future::Future;
use std::time::Duration;

use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::accumulator::accumulate;
use crate::buffer::{EventLog, ReplayCursor};
use crate::error::{BotStreamError, CoreResult};
use crate::http_client::SseStream;
use crate::model::{ChatResult, ChatReturn, EventPayload};
use crate::pump::{bootstrap, Handoff, PumpOutcome};
use crate::stream::{BoxEventStream, EventKind, StreamEvent};

#[derive(Debug)]
pub struct ChatTurn {
    accepted: Option<EventPayload>,
    log: EventLog,
    pump: Option<JoinHandle<PumpOutcome>>,
    outcome: Option<PumpOutcome>,
}

impl ChatTurn {
    /// Bootstrap a streaming turn and leave the rest of the stream to a pump task.
    /// Must be called within a tokio runtime.
    pub async fn from_lines(
        lines: SseStream,
        capacity: usize,
        permit: Option<OwnedSemaphorePermit>,
    ) -> CoreResult<Self> {
        let (log, handoff) = bootstrap(lines, capacity, permit).await?;
        Ok(match handoff {
            Handoff::Accepted { accepted, pump } => Self {
                accepted: Some(accepted),
                log,
                pump: Some(pump.spawn()),
                outcome: None,
            },
            Handoff::Finished(outcome) => Self {
                accepted: None,
                log,
                pump: None,
                outcome: Some(outcome),
            },
        })
    }

    /// Wrap a non-streaming response as a closed, single-event turn.
    pub fn from_return(ret: ChatReturn) -> CoreResult<Self> {
        if ret.code != 0 {
            return Err(BotStreamError::Api {
                code: ret.code,
                msg: ret.msg,
            });
        }
        let data = ret
            .data
            .ok_or_else(|| BotStreamError::Protocol("response carries no chat data".into()))?;
        let log = EventLog::sealed(vec![StreamEvent::new(
            EventKind::ChatInProgress,
            data.clone(),
        )]);
        Ok(Self {
            accepted: Some(data),
            log,
            pump: None,
            outcome: Some(PumpOutcome::Completed),
        })
    }

    /// Payload of the in-progress event. `None` if the stream ended before
    /// the turn was accepted.
    pub fn accepted(&self) -> Option<&EventPayload> {
        self.accepted.as_ref()
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.accepted.as_ref()?.conversation_id.as_deref()
    }

    pub fn chat_id(&self) -> Option<&str> {
        self.accepted.as_ref()?.id.as_deref()
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn cursor(&self) -> ReplayCursor {
        self.log.cursor()
    }

    /// Full replay from the first event; every call is independent.
    pub fn stream(&self) -> BoxEventStream {
        self.log.stream()
    }

    /// Fold the whole turn, waiting for it to end.
    pub async fn result(&self) -> ChatResult {
        accumulate(self.cursor(), std::future::pending()).await
    }

    /// Fold until the turn ends or `cancel` resolves, whichever is first.
    pub async fn result_until<F>(&self, cancel: F) -> ChatResult
    where
        F: Future<Output = ()>,
    {
        accumulate(self.cursor(), cancel).await
    }

    pub async fn result_within(&self, timeout: Duration) -> ChatResult {
        accumulate(self.cursor(), tokio::time::sleep(timeout)).await
    }

    /// Wait for the pump to finish. `None` if the pump task panicked or was aborted.
    pub async fn join(self) -> Option<PumpOutcome> {
        if let Some(outcome) = self.outcome {
            return Some(outcome);
        }
        let handle = self.pump?;
        match handle.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(error = %e, "pump task did not finish");
                None
            }
        }
    }
}
