use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::error::CoreResult;
use crate::http_client::{HttpClient, SseStream};
use crate::model::ChatReturn;
use crate::normalizer::WireChatRequest;

pub const CHAT_ENDPOINT: &str = "/v3/chat";

/// How a turn reaches the chat api.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Open a streaming turn. Errors here are setup errors; the body's
    /// lines belong to the caller once this returns.
    async fn open_stream(&self, req: &WireChatRequest) -> CoreResult<SseStream>;

    /// One request, one response body.
    async fn send(&self, req: &WireChatRequest) -> CoreResult<ChatReturn>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: HttpClient,
    base: String,
    token: SecretString,
}

impl HttpTransport {
    pub fn new(http: HttpClient, token: SecretString, base: impl Into<String>) -> Self {
        Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    #[cfg(test)]
    pub fn new_for_tests(server_base: &str) -> Self {
        Self::new(
            HttpClient::new_default().unwrap(),
            SecretString::new("test-token".into()),
            server_base,
        )
    }

    fn url(&self) -> String {
        format!("{}{}", self.base, CHAT_ENDPOINT)
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.token.expose_secret())
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn open_stream(&self, req: &WireChatRequest) -> CoreResult<SseStream> {
        let auth = self.auth();
        let hdrs = [("Authorization", auth.as_str())];
        self.http.post_lines(&self.url(), req, &hdrs).await
    }

    async fn send(&self, req: &WireChatRequest) -> CoreResult<ChatReturn> {
        let auth = self.auth();
        let hdrs = [("Authorization", auth.as_str())];
        self.http.post_json::<_, ChatReturn>(&self.url(), req, &hdrs).await
    }
}
