use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::config::HttpCfg;
use crate::error::{BotStreamError, CoreResult};
use crate::frame::truncate;
use crate::model::ApiError;

/// A boxed stream of body lines, terminators stripped.
pub type SseStream = Pin<Box<dyn Stream<Item = CoreResult<String>> + Send>>;

/// A boxed stream of raw body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = CoreResult<Bytes>> + Send>>;

/// Thin wrapper around reqwest::Client with defaults and helpers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
}

impl HttpClient {
    pub fn new_default() -> CoreResult<Self> {
        Self::from_cfg(&HttpCfg::default())
    }

    pub fn from_cfg(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .timeout(Duration::from_millis(cfg.request_timeout_ms));
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| BotStreamError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: "botstream/0.1".to_string(),
        })
    }

    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> CoreResult<R> {
        let mut req = self
            .inner
            .post(url)
            .json(body)
            .header("User-Agent", &self.user_agent);
        for (k, v) in headers {
            req = req.header(*k, *v);
        }

        let resp = req.send().await.map_err(|e| {
            debug!(error = %e, "request failed");
            BotStreamError::Unavailable
        })?;

        let status = resp.status();
        let headers = resp.headers().clone();
        if let Some(logid) = extract_request_id(&headers) {
            debug!(%logid, %status, "chat api responded");
        }

        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(map_http_error(status, parse_retry_after(&headers), &text));
        }

        resp.json::<R>().await.map_err(|e| BotStreamError::Http {
            code: status.as_u16(),
            message: format!("json decode error: {e}"),
        })
    }

    /// POST JSON and return the response body as a line stream.
    /// The connection stays open until the returned stream is dropped or exhausted.
    pub async fn post_lines<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> CoreResult<SseStream> {
        let mut req = self
            .inner
            .post(url)
            .json(body)
            .header("User-Agent", &self.user_agent)
            .header("Accept", "text/event-stream");
        for (k, v) in headers {
            req = req.header(*k, *v);
        }

        let resp = req.send().await.map_err(|e| {
            debug!(error = %e, "stream request failed");
            BotStreamError::Unavailable
        })?;

        let status = resp.status();
        let headers = resp.headers().clone();
        if let Some(logid) = extract_request_id(&headers) {
            debug!(%logid, %status, "chat stream opened");
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_http_error(status, parse_retry_after(&headers), &body));
        }

        let bytes = resp.bytes_stream().map(|chunk| {
            chunk.map_err(|e| {
                debug!(error = %e, "stream body read failed");
                BotStreamError::Unavailable
            })
        });
        Ok(line_stream(Box::pin(bytes)))
    }
}

/// Split a chunked byte stream into lines.
pub fn line_stream(bytes: ByteStream) -> SseStream {
    Box::pin(LineStream::new(bytes))
}

fn extract_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
    static CANDIDATES: [&str; 3] = ["x-tt-logid", "x-request-id", "request-id"];
    for k in CANDIDATES {
        if let Some(v) = headers.get(k)
            && let Ok(s) = v.to_str()
        {
            return Some(s.to_string());
        }
    }
    None
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    if let Some(v) = headers.get("retry-after")
        && let Ok(s) = v.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        return Some(secs);
    }
    None
}

fn map_http_error(status: StatusCode, retry_after: Option<u64>, body: &str) -> BotStreamError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => BotStreamError::RateLimited { retry_after },
        s if s.is_server_error() => BotStreamError::Unavailable,
        s => match serde_json::from_str::<ApiError>(body) {
            Ok(api) if api.code != 0 => api.into(),
            _ => BotStreamError::Http {
                code: s.as_u16(),
                message: truncate(body, 300),
            },
        },
    }
}

/// Longest line accepted from a response body.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Line splitter over a byte stream. Splits on raw `\n` before decoding so a
/// multi-byte character cut across chunks stays intact.
struct LineStream {
    inner: ByteStream,
    buf: Vec<u8>,
    /// Bytes of `buf` already known to hold no `\n`.
    scanned: usize,
    finished: bool,
}

impl LineStream {
    fn new(inner: ByteStream) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            scanned: 0,
            finished: false,
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') else {
            self.scanned = self.buf.len();
            return None;
        };
        let idx = self.scanned + offset;
        self.scanned = 0;
        let mut line: Vec<u8> = self.buf.drain(..=idx).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

impl Stream for LineStream {
    type Item = CoreResult<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(line) = self.take_line() {
                return Poll::Ready(Some(Ok(line)));
            }
            if self.finished {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    if self.buf.len() + chunk.len() > MAX_LINE_BYTES
                        && !chunk.contains(&b'\n')
                    {
                        self.finished = true;
                        self.buf.clear();
                        self.scanned = 0;
                        return Poll::Ready(Some(Err(BotStreamError::Protocol(format!(
                            "line longer than {MAX_LINE_BYTES} bytes"
                        )))));
                    }
                    self.buf.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    self.buf.clear();
                    self.scanned = 0;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    self.finished = true;
                    if !self.buf.is_empty() {
                        self.scanned = 0;
                        let tail = std::mem::take(&mut self.buf);
                        return Poll::Ready(Some(Ok(String::from_utf8_lossy(&tail).into_owned())));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
