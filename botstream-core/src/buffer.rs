//! Append-only event log shared by one writer and any number of replay cursors.
//!
//! The writer half (`EventSink`) is unique and closes the log when dropped. The
//! reader half (`EventLog`) is cheap to clone; every `cursor()` starts at index 0,
//! so each reader sees the full history in append order no matter when it starts.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use tokio::sync::Notify;
use tracing::warn;

use crate::stream::{BoxEventStream, StreamEvent};

#[derive(Debug, Default)]
struct LogState {
    events: Vec<Arc<StreamEvent>>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<LogState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LogState> {
        // state is only ever pushed to or flagged, so a poisoned guard is still consistent
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Create an open log with room for `capacity` events before reallocating.
pub fn event_log(capacity: usize) -> (EventSink, EventLog) {
    let shared = Arc::new(Shared {
        state: Mutex::new(LogState {
            events: Vec::with_capacity(capacity),
            closed: false,
        }),
        notify: Notify::new(),
    });
    (
        EventSink {
            shared: shared.clone(),
        },
        EventLog { shared },
    )
}

/// Sole writer of a log.
#[derive(Debug)]
pub struct EventSink {
    shared: Arc<Shared>,
}

impl EventSink {
    /// Append to the tail and wake every waiting cursor. Ignored once closed.
    pub fn append(&self, event: StreamEvent) {
        {
            let mut state = self.shared.lock();
            if state.closed {
                warn!(kind = %event.kind, "append after close ignored");
                return;
            }
            state.events.push(Arc::new(event));
        }
        self.shared.notify.notify_waiters();
    }

    /// Mark the log finished. Idempotent.
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_waiters();
    }

    pub(crate) fn len(&self) -> usize {
        self.shared.lock().events.len()
    }
}

impl Drop for EventSink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read handle to a log.
#[derive(Debug, Clone)]
pub struct EventLog {
    shared: Arc<Shared>,
}

impl EventLog {
    /// A log that is already closed and holds exactly `events`.
    pub fn sealed(events: Vec<StreamEvent>) -> Self {
        let (sink, log) = event_log(events.len());
        for ev in events {
            sink.append(ev);
        }
        drop(sink);
        log
    }

    /// New independent reader positioned at the first event.
    pub fn cursor(&self) -> ReplayCursor {
        ReplayCursor {
            shared: self.shared.clone(),
            position: 0,
        }
    }

    /// Full replay as a stream; a fresh cursor per call.
    pub fn stream(&self) -> BoxEventStream {
        self.cursor().into_stream()
    }

    pub fn len(&self) -> usize {
        self.shared.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

/// Result of a cancellable read.
#[derive(Debug, Clone, PartialEq)]
pub enum CursorStep {
    Event(Arc<StreamEvent>),
    End,
    Cancelled,
}

/// Per-reader position into a log.
#[derive(Debug)]
pub struct ReplayCursor {
    shared: Arc<Shared>,
    position: usize,
}

impl ReplayCursor {
    pub fn position(&self) -> usize {
        self.position
    }

    /// Next event, waiting while the log is open and exhausted.
    /// `None` once the log is closed and fully read.
    ///
    /// Cancel safe: the position only advances when an event is returned.
    pub async fn next(&mut self) -> Option<Arc<StreamEvent>> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // register before inspecting so an append between check and await still wakes us
            notified.as_mut().enable();
            {
                let state = self.shared.lock();
                if let Some(ev) = state.events.get(self.position) {
                    self.position += 1;
                    return Some(ev.clone());
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Like `next`, but returns `Cancelled` if `cancel` resolves first.
    /// An event that is already available wins over a pending cancel only if
    /// `cancel` has not resolved yet.
    pub async fn next_until<F>(&mut self, cancel: F) -> CursorStep
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            _ = cancel => CursorStep::Cancelled,
            ev = self.next() => match ev {
                Some(ev) => CursorStep::Event(ev),
                None => CursorStep::End,
            },
        }
    }

    pub fn into_stream(self) -> BoxEventStream {
        futures::stream::unfold(self, |mut cursor| async move {
            cursor.next().await.map(|ev| (ev, cursor))
        })
        .boxed()
    }
}
