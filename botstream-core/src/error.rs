use thiserror::Error;

use crate::model::ApiError;

/// Core error type for botstream.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum BotStreamError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rate limited by chat api")]
    RateLimited { retry_after: Option<u64> },

    #[error("chat api unavailable")]
    Unavailable,

    #[error("http error: {code} {message}")]
    Http { code: u16, message: String },

    /// Structured error object returned by the chat api, either in place of a
    /// stream or inside a non-streaming response wrapper.
    #[error("api error: code: {code}, msg: {msg}")]
    Api { code: i64, msg: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<ApiError> for BotStreamError {
    fn from(e: ApiError) -> Self {
        Self::Api {
            code: e.code,
            msg: e.msg,
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, BotStreamError>;
