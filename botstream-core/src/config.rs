use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use tokio::sync::Semaphore;

use crate::error::{BotStreamError, CoreResult};

pub const HOST_COZE_CN: &str = "https://api.coze.cn";
pub const HOST_COZE_COM: &str = "https://api.coze.com";

fn default_host() -> String {
    HOST_COZE_CN.to_string()
}
fn default_api_key_env() -> String {
    "COZE_API_TOKEN".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BotCfg {
    pub bot_id: String,
    /// Api base url (default https://api.coze.cn)
    #[serde(default = "default_host")]
    pub host: String,
    /// Name of the environment variable that contains the api token.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout in milliseconds, streamed body included (default 600000ms)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    600_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StreamCfg {
    /// Events preallocated per turn log (default 100)
    #[serde(default = "default_initial_capacity")]
    pub initial_capacity: usize,
    /// Streaming turns allowed to pump concurrently per client (default 10000).
    /// Starting a turn waits while the limit is reached.
    #[serde(default = "default_max_active_turns")]
    pub max_active_turns: usize,
}

impl Default for StreamCfg {
    fn default() -> Self {
        Self {
            initial_capacity: default_initial_capacity(),
            max_active_turns: default_max_active_turns(),
        }
    }
}

fn default_initial_capacity() -> usize {
    100
}
fn default_max_active_turns() -> usize {
    10_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
    pub bot: BotCfg,
    #[serde(default)]
    pub http: HttpCfg,
    #[serde(default)]
    pub stream: StreamCfg,
}

impl Config {
    /// Config for `bot_id` with every other field at its default.
    pub fn new(bot_id: impl Into<String>) -> Self {
        Self {
            bot: BotCfg {
                bot_id: bot_id.into(),
                host: default_host(),
                api_key_env: default_api_key_env(),
            },
            http: HttpCfg::default(),
            stream: StreamCfg::default(),
        }
    }

    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(BotStreamError::from)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| BotStreamError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str::<Self>(s).map_err(|e| BotStreamError::Other(e.into()))?
            }
            Some("toml") => toml::from_str::<Self>(s).map_err(|e| BotStreamError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| BotStreamError::Other(e.into()))
                .or_else(|_| {
                    toml::from_str::<Self>(s).map_err(|e| BotStreamError::Other(e.into()))
                })?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.bot.bot_id.trim().is_empty() {
            return Err(BotStreamError::Validation("bot.bot_id must not be empty".into()));
        }
        if self.bot.host.trim().is_empty() {
            return Err(BotStreamError::Validation("bot.host must not be empty".into()));
        }
        if self.stream.max_active_turns == 0 {
            return Err(BotStreamError::Validation(
                "stream.max_active_turns must be at least 1".into(),
            ));
        }
        if self.stream.max_active_turns > Semaphore::MAX_PERMITS {
            return Err(BotStreamError::Validation(format!(
                "stream.max_active_turns must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        Ok(())
    }
}
