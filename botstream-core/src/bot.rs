use std::sync::Arc;

use secrecy::SecretString;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::{Config, StreamCfg};
use crate::error::{BotStreamError, CoreResult};
use crate::http_client::HttpClient;
use crate::model::ChatRequest;
use crate::normalizer::normalize_chat;
use crate::transport::{ChatTransport, HttpTransport};
use crate::turn::ChatTurn;

/// Chat client bound to one bot.
#[derive(Clone)]
pub struct Bot {
    bot_id: String,
    transport: Arc<dyn ChatTransport>,
    stream_cfg: StreamCfg,
    admission: Arc<Semaphore>,
    permits: usize,
}

impl Bot {
    pub fn new(cfg: &Config, token: SecretString) -> CoreResult<Self> {
        cfg.validate()?;
        let http = HttpClient::from_cfg(&cfg.http)?;
        let transport = HttpTransport::new(http, token, cfg.bot.host.clone());
        Ok(Self::with_transport(cfg, Arc::new(transport)))
    }

    /// Like `new`, with the token read from the variable named by `bot.api_key_env`.
    pub fn from_config(cfg: &Config) -> CoreResult<Self> {
        let var = &cfg.bot.api_key_env;
        let token = std::env::var(var)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| BotStreamError::Validation(format!("{var} is not set")))?;
        Self::new(cfg, SecretString::from(token))
    }

    /// The admission limit is clamped into `1..=Semaphore::MAX_PERMITS`;
    /// `Config::validate` rejects values outside that range.
    pub fn with_transport(cfg: &Config, transport: Arc<dyn ChatTransport>) -> Self {
        let permits = cfg.stream.max_active_turns.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            bot_id: cfg.bot.bot_id.clone(),
            transport,
            stream_cfg: cfg.stream.clone(),
            admission: Arc::new(Semaphore::new(permits)),
            permits,
        }
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    /// Streaming turns currently holding an admission permit.
    pub fn active_turns(&self) -> usize {
        self.permits - self.admission.available_permits()
    }

    /// Start a turn.
    ///
    /// Streaming turns return once the turn is accepted and keep streaming in
    /// the background; setup failures are returned here. Waits while
    /// `stream.max_active_turns` streaming turns are already running.
    pub async fn chat(&self, req: ChatRequest) -> CoreResult<ChatTurn> {
        let wire = normalize_chat(req, &self.bot_id)?;
        if !wire.stream {
            let ret = self.transport.send(&wire).await?;
            return ChatTurn::from_return(ret);
        }

        let permit = self
            .admission
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| BotStreamError::Other(e.into()))?;
        debug!(bot_id = %self.bot_id, user_id = %wire.user_id, "opening chat stream");
        let lines = self.transport.open_stream(&wire).await?;
        ChatTurn::from_lines(lines, self.stream_cfg.initial_capacity, Some(permit)).await
    }
}
