//! Producer side of a streaming turn.
//!
//! `bootstrap` runs inline in the caller: it reads frames until the turn is
//! accepted (the in-progress event), so ids are available without waiting for the
//! answer. The remaining read loop is handed to a `StreamPump` that runs on its own
//! task until the stream terminates. Every exit path closes the log and drops the
//! byte source.

use std::time::Instant;

use futures_util::StreamExt;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tracing::{debug, field::Empty, info, warn, Span};
use tracing_futures::Instrument;

use crate::buffer::{event_log, EventLog, EventSink};
use crate::error::{BotStreamError, CoreResult};
use crate::frame::{Frame, FrameParser};
use crate::http_client::SseStream;
use crate::model::{ApiError, ChatUsage, EventPayload};
use crate::stream::{EventKind, StreamEvent};
use crate::telemetry::{self, TurnLog};

/// `last_error.code` of the failure event synthesized when a stream breaks off.
pub const STREAM_INTERRUPTED_CODE: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpOutcome {
    /// Terminal sentinel read, or the source ended after the turn completed.
    Completed,
    /// The server reported the turn as failed.
    Failed,
    /// Transport error, parse error or premature end of the source.
    Interrupted(String),
}

impl PumpOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted(_) => "interrupted",
        }
    }
}

/// Where the inline part of a turn stopped.
pub enum Handoff {
    /// Turn accepted; the rest of the stream is left to the pump.
    Accepted {
        accepted: EventPayload,
        pump: StreamPump,
    },
    /// The stream terminated before (or instead of) being accepted.
    Finished(PumpOutcome),
}

enum Step {
    Appended(EventKind),
    Done,
    End,
    Broken(BotStreamError),
}

pub struct StreamPump {
    lines: SseStream,
    parser: FrameParser,
    sink: EventSink,
    accepted: Option<EventPayload>,
    usage: Option<ChatUsage>,
    last_error: Option<ApiError>,
    saw_completed: bool,
    started: Instant,
    span: Span,
    _permit: Option<OwnedSemaphorePermit>,
}

/// Read the stream inline until the turn is accepted.
///
/// Fails, without creating a log, if the body is an error object instead of a
/// stream or breaks off before its first frame. Any later failure is recorded in
/// the log instead.
pub async fn bootstrap(
    mut lines: SseStream,
    capacity: usize,
    permit: Option<OwnedSemaphorePermit>,
) -> CoreResult<(EventLog, Handoff)> {
    let started = Instant::now();
    let mut parser = FrameParser::new();
    let first = loop {
        match lines.next().await {
            Some(Ok(line)) => {
                if let Some(frame) = parser.feed(&line)? {
                    break frame;
                }
            }
            Some(Err(e)) => return Err(e),
            None => {
                if let Some(err) = parser.finish() {
                    return Err(err);
                }
                let reason = if parser.is_streaming() {
                    "stream ended before its first frame"
                } else {
                    "empty response body"
                };
                return Err(BotStreamError::Protocol(reason.into()));
            }
        }
    };

    let span = tracing::info_span!(
        "chat.turn",
        bot.id = Empty,
        conversation.id = Empty,
        chat.id = Empty,
        turn.outcome = Empty,
        turn.events = Empty,
    );
    let (sink, log) = event_log(capacity);
    let mut pump = StreamPump {
        lines,
        parser,
        sink,
        accepted: None,
        usage: None,
        last_error: None,
        saw_completed: false,
        started,
        span,
        _permit: permit,
    };

    let mut step = pump.accept(first);
    loop {
        if let Step::Appended(EventKind::ChatInProgress) = step {
            let accepted = pump.accepted.clone().unwrap_or_default();
            debug!(parent: &pump.span, "turn accepted");
            return Ok((log, Handoff::Accepted { accepted, pump }));
        }
        if let Some(outcome) = pump.outcome_of(step) {
            pump.close(&outcome);
            return Ok((log, Handoff::Finished(outcome)));
        }
        step = pump.step().await;
    }
}

impl StreamPump {
    /// Drain the rest of the stream into the log.
    pub async fn run(mut self) -> PumpOutcome {
        let outcome = loop {
            let step = self.step().await;
            if let Some(outcome) = self.outcome_of(step) {
                break outcome;
            }
        };
        self.close(&outcome);
        outcome
    }

    /// Run on a dedicated task scoped to this turn.
    pub fn spawn(self) -> JoinHandle<PumpOutcome> {
        let span = self.span.clone();
        tokio::spawn(self.run().instrument(span))
    }

    async fn step(&mut self) -> Step {
        loop {
            match self.lines.next().await {
                None => return Step::End,
                Some(Err(e)) => return Step::Broken(e),
                Some(Ok(line)) => match self.parser.feed(&line) {
                    Ok(None) => continue,
                    Ok(Some(frame)) => return self.accept(frame),
                    Err(e) => return Step::Broken(e),
                },
            }
        }
    }

    fn accept(&mut self, frame: Frame) -> Step {
        let ev = match frame {
            Frame::Done => return Step::Done,
            Frame::Event(ev) => ev,
        };
        match ev.kind {
            EventKind::ChatInProgress if self.accepted.is_none() => {
                let p = &ev.payload;
                self.span.record("bot.id", p.bot_id.as_deref().unwrap_or_default());
                self.span
                    .record("conversation.id", p.conversation_id.as_deref().unwrap_or_default());
                self.span.record("chat.id", p.id.as_deref().unwrap_or_default());
                self.accepted = Some(ev.payload.clone());
            }
            EventKind::ChatCompleted => {
                self.saw_completed = true;
                self.usage = ev.payload.usage;
            }
            EventKind::ChatFailed => {
                self.last_error = ev.payload.last_error.clone();
            }
            _ => {}
        }
        let kind = ev.kind.clone();
        self.sink.append(ev);
        Step::Appended(kind)
    }

    fn outcome_of(&self, step: Step) -> Option<PumpOutcome> {
        match step {
            // `done` never reaches the log, so the only terminal kind appended is a failure
            Step::Appended(kind) if kind.is_terminal() => Some(PumpOutcome::Failed),
            Step::Appended(_) => None,
            Step::Done => Some(PumpOutcome::Completed),
            Step::End | Step::Broken(_) if self.saw_completed => {
                debug!(parent: &self.span, "stream ended after completion without sentinel");
                Some(PumpOutcome::Completed)
            }
            Step::End => Some(PumpOutcome::Interrupted(
                "stream ended before the turn finished".into(),
            )),
            Step::Broken(e) => Some(PumpOutcome::Interrupted(e.to_string())),
        }
    }

    /// Append the synthetic failure if needed, close the log and report.
    /// Consumes the pump so the byte source and admission permit go with it.
    fn close(mut self, outcome: &PumpOutcome) {
        if let PumpOutcome::Interrupted(reason) = outcome {
            warn!(parent: &self.span, %reason, "turn interrupted");
            let failure = self.interruption_event(reason);
            self.last_error = failure.payload.last_error.clone();
            self.sink.append(failure);
        }
        self.sink.close();

        let events = self.sink.len() as u64;
        let latency_ms = self.started.elapsed().as_millis() as u64;
        self.span.record("turn.outcome", outcome.as_str());
        self.span.record("turn.events", events);
        info!(
            parent: &self.span,
            outcome = outcome.as_str(),
            events,
            latency_ms,
            "turn finished"
        );

        let accepted = self.accepted.as_ref();
        let mut log = TurnLog::new()
            .bot_id_opt(accepted.and_then(|p| p.bot_id.as_deref()))
            .conversation_id_opt(accepted.and_then(|p| p.conversation_id.as_deref()))
            .chat_id_opt(accepted.and_then(|p| p.id.as_deref()))
            .outcome(outcome.as_str())
            .events(events)
            .latency_ms(latency_ms)
            .tokens(
                self.usage.map(|u| u.input_count),
                self.usage.map(|u| u.output_count),
                self.usage.map(|u| u.token_count),
            );
        if let Some(err) = &self.last_error {
            log = log.error(err.code, &err.msg);
        }
        telemetry::emit_turn(log);
    }

    fn interruption_event(&self, reason: &str) -> StreamEvent {
        let accepted = self.accepted.clone().unwrap_or_default();
        StreamEvent::new(
            EventKind::ChatFailed,
            EventPayload {
                id: accepted.id,
                conversation_id: accepted.conversation_id,
                bot_id: accepted.bot_id,
                status: Some("failed".into()),
                last_error: Some(ApiError {
                    code: STREAM_INTERRUPTED_CODE,
                    msg: reason.to_string(),
                }),
                ..Default::default()
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::line_stream;
    use crate::telemetry::{test_set_capture_enabled, TelemetrySink};
    use bytes::Bytes;
    use once_cell::sync::Lazy;
    use std::sync::{Arc, Mutex};

    const ACCEPTED: &str = "event:conversation.chat.in_progress\n\
        data:{\"id\":\"T1\",\"conversation_id\":\"C1\",\"bot_id\":\"B1\",\
        \"status\":\"in_progress\"}\n\n";
    const DELTA: &str =
        "event:conversation.message.delta\ndata:{\"type\":\"answer\",\"content\":\"Hi\"}\n\n";
    const COMPLETED: &str = "event:conversation.chat.completed\n\
        data:{\"id\":\"T1\",\"usage\":\
        {\"token_count\":3,\"output_count\":1,\"input_count\":2}}\n\n";
    const DONE: &str = "event:done\ndata:\"[DONE]\"\n\n";

    fn body(parts: &[&str]) -> SseStream {
        let chunks: Vec<CoreResult<Bytes>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        line_stream(Box::pin(futures::stream::iter(chunks)))
    }

    /// Body fed by hand; the sender sees `is_closed` once the reader drops the source.
    fn channel_body() -> (
        tokio::sync::mpsc::UnboundedSender<CoreResult<Bytes>>,
        SseStream,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let chunks = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|c| (c, rx))
        });
        (tx, line_stream(Box::pin(chunks)))
    }

    async fn kinds(log: &EventLog) -> Vec<EventKind> {
        log.stream().map(|e| e.kind.clone()).collect().await
    }

    async fn accepted_pump(parts: &[&str]) -> (EventLog, EventPayload, StreamPump) {
        match bootstrap(body(parts), 8, None).await.expect("bootstrap") {
            (log, Handoff::Accepted { accepted, pump }) => (log, accepted, pump),
            (_, Handoff::Finished(o)) => panic!("unexpected finish {o:?}"),
        }
    }

    #[tokio::test]
    async fn bootstrap_stops_at_acceptance() {
        let (log, accepted, pump) = accepted_pump(&[ACCEPTED, DELTA, COMPLETED, DONE]).await;
        assert_eq!(accepted.conversation_id.as_deref(), Some("C1"));
        assert_eq!(accepted.id.as_deref(), Some("T1"));
        assert_eq!(log.len(), 1);
        assert!(!log.is_closed());

        let outcome = pump.spawn().await.unwrap();
        assert_eq!(outcome, PumpOutcome::Completed);
        assert!(log.is_closed());
        assert_eq!(
            kinds(&log).await,
            vec![
                EventKind::ChatInProgress,
                EventKind::MessageDelta,
                EventKind::ChatCompleted
            ]
        );
    }

    #[tokio::test]
    async fn setup_error_creates_no_log() {
        let err = bootstrap(body(&["{\"code\":4000,\"msg\":\"bad request\"}\n"]), 8, None)
            .await
            .err()
            .expect("setup error");
        match err {
            BotStreamError::Api { code, msg } => {
                assert_eq!(code, 4000);
                assert_eq!(msg, "bad request");
            }
            other => panic!("expected Api, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn multi_line_error_object_is_setup_error() {
        let err = bootstrap(
            body(&["{\n  \"code\": 4100,\n", "  \"msg\": \"authentication is invalid\"\n}"]),
            8,
            None,
        )
        .await
        .err()
        .expect("setup error");
        match err {
            BotStreamError::Api { code, msg } => {
                assert_eq!(code, 4100);
                assert_eq!(msg, "authentication is invalid");
            }
            other => panic!("expected Api, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn event_line_without_frame_then_end_is_setup_error() {
        match bootstrap(body(&["event:conversation.chat.in_progress\n"]), 8, None).await {
            Err(BotStreamError::Protocol(msg)) => assert!(msg.contains("first frame")),
            Err(other) => panic!("expected Protocol, got {other:?}"),
            Ok(_) => panic!("expected setup error"),
        }
    }

    #[tokio::test]
    async fn empty_body_is_setup_error() {
        assert!(matches!(
            bootstrap(body(&[]), 8, None).await.err(),
            Some(BotStreamError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn failure_before_acceptance_finishes_inline() {
        let failed = "event:conversation.chat.failed\n\
            data:{\"last_error\":{\"code\":5000,\"msg\":\"busy\"}}\n\n";
        let (log, handoff) = bootstrap(body(&[failed, DONE]), 8, None).await.unwrap();
        assert!(matches!(handoff, Handoff::Finished(PumpOutcome::Failed)));
        assert!(log.is_closed());
        assert_eq!(kinds(&log).await, vec![EventKind::ChatFailed]);
    }

    #[tokio::test]
    async fn failed_frame_ends_stream_and_later_frames_are_not_read() {
        let failed = "event:conversation.chat.failed\n\
            data:{\"id\":\"T1\",\"last_error\":{\"code\":5000,\"msg\":\"busy\"}}\n\n";
        let (log, _, pump) = accepted_pump(&[ACCEPTED, DELTA, failed, DELTA, DONE]).await;
        assert_eq!(pump.run().await, PumpOutcome::Failed);
        assert_eq!(
            kinds(&log).await,
            vec![
                EventKind::ChatInProgress,
                EventKind::MessageDelta,
                EventKind::ChatFailed
            ]
        );
    }

    #[tokio::test]
    async fn premature_end_synthesizes_failure_event() {
        let (log, _, pump) = accepted_pump(&[ACCEPTED, DELTA]).await;
        let outcome = pump.run().await;
        assert!(matches!(outcome, PumpOutcome::Interrupted(_)));

        let events: Vec<_> = log.stream().collect().await;
        assert_eq!(events.len(), 3);
        let last = &events[2];
        assert_eq!(last.kind, EventKind::ChatFailed);
        assert_eq!(last.payload.conversation_id.as_deref(), Some("C1"));
        assert_eq!(last.payload.id.as_deref(), Some("T1"));
        assert_eq!(
            last.payload.last_error.as_ref().map(|e| e.code),
            Some(STREAM_INTERRUPTED_CODE)
        );
    }

    #[tokio::test]
    async fn transport_error_mid_stream_keeps_partial_events() {
        let chunks: Vec<CoreResult<Bytes>> = vec![
            Ok(Bytes::from(ACCEPTED)),
            Ok(Bytes::from(DELTA)),
            Err(BotStreamError::Unavailable),
        ];
        let lines = line_stream(Box::pin(futures::stream::iter(chunks)));
        let (log, handoff) = bootstrap(lines, 8, None).await.unwrap();
        let Handoff::Accepted { pump, .. } = handoff else {
            panic!("expected acceptance");
        };
        match pump.run().await {
            PumpOutcome::Interrupted(reason) => assert!(reason.contains("unavailable")),
            other => panic!("unexpected {other:?}"),
        }
        let events: Vec<_> = log.stream().collect().await;
        assert_eq!(events[1].as_text_delta(), Some("Hi"));
        assert_eq!(events[2].kind, EventKind::ChatFailed);
    }

    #[tokio::test]
    async fn protocol_violation_mid_stream_interrupts() {
        let empty_data = "event:conversation.message.delta\ndata:\n\n";
        let (log, _, pump) = accepted_pump(&[ACCEPTED, empty_data, DELTA, DONE]).await;
        assert!(matches!(pump.run().await, PumpOutcome::Interrupted(_)));
        assert_eq!(
            kinds(&log).await,
            vec![EventKind::ChatInProgress, EventKind::ChatFailed]
        );
    }

    #[tokio::test]
    async fn end_after_completion_without_sentinel_is_completed() {
        let (log, _, pump) = accepted_pump(&[ACCEPTED, DELTA, COMPLETED]).await;
        assert_eq!(pump.run().await, PumpOutcome::Completed);
        assert_eq!(kinds(&log).await.last(), Some(&EventKind::ChatCompleted));
    }

    #[tokio::test]
    async fn double_sentinel_stops_at_first() {
        let (log, _, pump) = accepted_pump(&[ACCEPTED, DONE, DONE, DELTA]).await;
        assert_eq!(pump.run().await, PumpOutcome::Completed);
        assert_eq!(kinds(&log).await, vec![EventKind::ChatInProgress]);
    }

    #[tokio::test]
    async fn failed_turn_drops_source_while_server_keeps_it_open() {
        let failed = "event:conversation.chat.failed\n\
            data:{\"id\":\"T1\",\"last_error\":{\"code\":5000,\"msg\":\"busy\"}}\n\n";
        let (tx, lines) = channel_body();
        tx.send(Ok(Bytes::from(ACCEPTED))).unwrap();
        let (log, handoff) = bootstrap(lines, 8, None).await.unwrap();
        let Handoff::Accepted { pump, .. } = handoff else {
            panic!("expected acceptance");
        };
        let running = pump.spawn();
        assert!(!tx.is_closed());

        tx.send(Ok(Bytes::from(failed))).unwrap();
        assert_eq!(running.await.unwrap(), PumpOutcome::Failed);
        assert!(tx.is_closed());
        assert!(log.is_closed());
    }

    #[tokio::test]
    async fn interrupted_turn_drops_source() {
        let (tx, lines) = channel_body();
        tx.send(Ok(Bytes::from(ACCEPTED))).unwrap();
        let (log, handoff) = bootstrap(lines, 8, None).await.unwrap();
        let Handoff::Accepted { pump, .. } = handoff else {
            panic!("expected acceptance");
        };
        let running = pump.spawn();

        tx.send(Ok(Bytes::from(DELTA))).unwrap();
        tx.send(Err(BotStreamError::Unavailable)).unwrap();
        assert!(matches!(running.await.unwrap(), PumpOutcome::Interrupted(_)));
        assert!(tx.is_closed());
        assert_eq!(
            kinds(&log).await,
            vec![
                EventKind::ChatInProgress,
                EventKind::MessageDelta,
                EventKind::ChatFailed
            ]
        );
    }

    #[tokio::test]
    async fn failure_before_acceptance_drops_source() {
        let failed = "event:conversation.chat.failed\n\
            data:{\"last_error\":{\"code\":5000,\"msg\":\"busy\"}}\n\n";
        let (tx, lines) = channel_body();
        tx.send(Ok(Bytes::from(failed))).unwrap();
        let (log, handoff) = bootstrap(lines, 8, None).await.unwrap();
        assert!(matches!(handoff, Handoff::Finished(PumpOutcome::Failed)));
        assert!(tx.is_closed());
        assert!(log.is_closed());
    }

    #[tokio::test]
    async fn permit_is_released_when_pump_ends() {
        let sem = Arc::new(tokio::sync::Semaphore::new(1));
        let permit = sem.clone().acquire_owned().await.unwrap();
        let (_log, handoff) = bootstrap(body(&[ACCEPTED, DONE]), 8, Some(permit))
            .await
            .unwrap();
        assert_eq!(sem.available_permits(), 0);
        let Handoff::Accepted { pump, .. } = handoff else {
            panic!("expected acceptance");
        };
        pump.spawn().await.unwrap();
        assert_eq!(sem.available_permits(), 1);
    }

    static TURN_LOGS: Lazy<Mutex<Vec<TurnLog>>> = Lazy::new(|| Mutex::new(Vec::new()));

    struct TestSink;
    impl TelemetrySink for TestSink {
        fn record_turn(&self, log: TurnLog) {
            TURN_LOGS.lock().unwrap().push(log);
        }
    }

    #[tokio::test]
    async fn finished_turn_is_reported_to_sink_and_span() {
        let _ = telemetry::set_telemetry_sink(Arc::new(TestSink));
        test_set_capture_enabled(true);
        let (store, _guard) = telemetry::test_span::install_capture();

        let (_log, _, pump) = accepted_pump(&[ACCEPTED, DELTA, COMPLETED, DONE]).await;
        assert_eq!(pump.spawn().await.unwrap(), PumpOutcome::Completed);
        test_set_capture_enabled(false);

        let logs = TURN_LOGS.lock().unwrap().clone();
        let log = logs
            .iter()
            .find(|l| {
                l.chat_id.as_deref() == Some("T1") && l.outcome.as_deref() == Some("completed")
            })
            .expect("turn log");
        assert_eq!(log.conversation_id.as_deref(), Some("C1"));
        assert_eq!(log.bot_id.as_deref(), Some("B1"));
        assert_eq!(log.events, 3);
        assert_eq!(log.tokens_total, Some(3));
        assert_eq!(log.error_code, None);

        let fields = store.fields_of("chat.turn").expect("span captured");
        assert_eq!(fields.get("conversation.id").map(String::as_str), Some("C1"));
        assert_eq!(fields.get("turn.outcome").map(String::as_str), Some("completed"));
        assert_eq!(fields.get("turn.events").map(String::as_str), Some("3"));
    }
}
