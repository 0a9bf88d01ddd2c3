use serde::{Deserialize, Serialize};

/// Structured record of one finished streaming turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnLog {
    pub bot_id: Option<String>,
    pub conversation_id: Option<String>,
    pub chat_id: Option<String>,

    /// "completed", "failed" or "interrupted".
    pub outcome: Option<String>,
    /// Events appended to the turn's log, synthesized ones included.
    pub events: u64,
    /// Time from the first byte read to the end of the stream.
    pub latency_ms: Option<u64>,

    pub tokens_input: Option<u64>,
    pub tokens_output: Option<u64>,
    pub tokens_total: Option<u64>,

    pub error_code: Option<i64>,
    pub error_message: Option<String>,
}

impl TurnLog {
    pub fn new() -> Self { Self::default() }
    pub fn bot_id_opt(mut self, v: Option<&str>) -> Self {
        self.bot_id = v.map(|s| s.to_string());
        self
    }
    pub fn conversation_id_opt(mut self, v: Option<&str>) -> Self {
        self.conversation_id = v.map(|s| s.to_string());
        self
    }
    pub fn chat_id_opt(mut self, v: Option<&str>) -> Self {
        self.chat_id = v.map(|s| s.to_string());
        self
    }
    pub fn outcome(mut self, v: &str) -> Self { self.outcome = Some(v.to_string()); self }
    pub fn events(mut self, n: u64) -> Self { self.events = n; self }
    pub fn latency_ms(mut self, v: u64) -> Self { self.latency_ms = Some(v); self }
    pub fn tokens(mut self, input: Option<u64>, output: Option<u64>, total: Option<u64>) -> Self {
        self.tokens_input = input; self.tokens_output = output; self.tokens_total = total; self
    }
    pub fn error(mut self, code: i64, message: &str) -> Self {
        self.error_code = Some(code);
        self.error_message = Some(message.to_string());
        self
    }
}
