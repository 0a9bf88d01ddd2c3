//! Telemetry hooks for finished turns.
//! By default, nothing is emitted unless a sink is installed via `set_telemetry_sink`.

pub mod types;
#[cfg(test)]
pub mod test_span;

pub use types::*;

use std::sync::Arc;

use once_cell::sync::OnceCell;

/// Implement this to receive turn records.
///
/// Requirements:
/// - Implementations must be thread-safe (`Send + Sync`) and `'static`.
/// - `record_turn` is called from the pump task of each turn; avoid panicking and blocking.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record_turn(&self, log: TurnLog);
}

static TELEMETRY_SINK: OnceCell<Arc<dyn TelemetrySink>> = OnceCell::new();

// In tests, gate emission to only the calling test thread to avoid cross-test interference.
#[cfg(test)]
thread_local! {
    static TEST_CAPTURE: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Install a global telemetry sink. Returns `false` if a sink is already installed.
///
/// This is a write-once global for the process lifetime (backed by `OnceCell`).
pub fn set_telemetry_sink(sink: Arc<dyn TelemetrySink>) -> bool {
    TELEMETRY_SINK.set(sink).is_ok()
}

/// Deliver a turn record if a sink is installed.
///
/// In tests, emission is suppressed unless enabled via `test_set_capture_enabled`.
#[inline]
pub(crate) fn emit_turn(log: TurnLog) {
    #[cfg(test)]
    {
        if !TEST_CAPTURE.with(|c| c.get()) {
            return;
        }
    }
    if let Some(sink) = TELEMETRY_SINK.get() {
        sink.record_turn(log);
    }
}

#[cfg(test)]
/// Test-only helper: enable or disable capture for the current test thread.
///
/// Pumps run on the runtime's threads; use a current-thread runtime when capturing.
pub fn test_set_capture_enabled(enabled: bool) {
    TEST_CAPTURE.with(|c| c.set(enabled));
}
