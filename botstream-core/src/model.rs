use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    #[serde(other)]
    Other,
}

/// Message type tag. Unknown tags decode as `Other` so new server-side
/// message kinds do not break event decoding.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Query,
    Answer,
    FunctionCall,
    ToolOutput,
    ToolResponse,
    FollowUp,
    Verbose,
    #[serde(other)]
    Other,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    ObjectString,
    Card,
    #[serde(other)]
    Other,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentItemType {
    Text,
    File,
    Image,
}

/// One element of a multi-modal message.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub kind: ContentItemType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
}

impl ContentItem {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: ContentItemType::Text,
            text: Some(text.into()),
            file_id: None,
            file_url: None,
        }
    }

    pub fn file_id(kind: ContentItemType, file_id: impl Into<String>) -> Self {
        Self {
            kind,
            text: None,
            file_id: Some(file_id.into()),
            file_url: None,
        }
    }

    pub fn file_url(kind: ContentItemType, file_url: impl Into<String>) -> Self {
        Self {
            kind,
            text: None,
            file_id: None,
            file_url: Some(file_url.into()),
        }
    }
}

/// Message body. The variant decides the wire `content_type`:
/// `Text` is sent as `text`, `Items` as a JSON-encoded `object_string`.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Items(Vec<ContentItem>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub kind: Option<MessageType>,
    pub content: MessageContent,
    pub meta_data: Option<serde_json::Map<String, serde_json::Value>>,
}

impl ChatMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            kind: Some(MessageType::Query),
            content: MessageContent::Text(text.into()),
            meta_data: None,
        }
    }

    pub fn user_items(items: Vec<ContentItem>) -> Self {
        Self {
            role: Role::User,
            kind: Some(MessageType::Query),
            content: MessageContent::Items(items),
            meta_data: None,
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            kind: Some(MessageType::Answer),
            content: MessageContent::Text(text.into()),
            meta_data: None,
        }
    }
}

/// Caller-side chat request. The bot id comes from the client configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatRequest {
    /// Empty means "generate one".
    pub user_id: String,
    pub additional_messages: Vec<ChatMessage>,
    pub stream: bool,
    pub auto_save_history: bool,
    pub custom_variables: Option<HashMap<String, String>>,
    pub meta_data: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChatUsage {
    #[serde(default)]
    pub token_count: u64,
    #[serde(default)]
    pub output_count: u64,
    #[serde(default)]
    pub input_count: u64,
}

/// Error object as the chat api reports it, both as a setup failure and as
/// the `last_error` of a failed turn.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct ApiError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code: {}, msg: {}", self.code, self.msg)
    }
}

/// Payload shared by every event kind. Fields a kind does not use are absent.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct EventPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ApiError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ChatUsage>,
}

/// Non-streaming response body: an error wrapper and/or one chat payload.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ChatReturn {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: Option<EventPayload>,
}

/// Final state of a turn, folded from its event sequence.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ChatResult {
    pub conversation_id: Option<String>,
    pub chat_id: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub answer: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub follow_up: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ChatUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ApiError>,
}
