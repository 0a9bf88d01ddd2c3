use std::collections::HashMap;

use serde::Serialize;
use unicode_normalization::UnicodeNormalization;

use crate::error::{BotStreamError, CoreResult};
use crate::model::{
    ChatMessage, ChatRequest, ContentItem, ContentType, MessageContent, MessageType, Role,
};

/// Request body for the chat endpoint.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct WireChatRequest {
    pub bot_id: String,
    pub user_id: String,
    pub additional_messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    pub auto_save_history: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_variables: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta_data: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct WireMessage {
    pub role: Role,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageType>,
    pub content: String,
    pub content_type: ContentType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta_data: Option<serde_json::Map<String, serde_json::Value>>,
}

fn clean_text(s: &str) -> String {
    // Unicode NFC normalization + BOM strip + CRLF -> LF
    let mut t = s.nfc().collect::<String>();
    if t.starts_with('\u{FEFF}') {
        t.remove(0);
    }
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    t
}

fn normalize_message(msg: ChatMessage) -> CoreResult<WireMessage> {
    let (content, content_type) = match msg.content {
        MessageContent::Text(text) => (clean_text(&text), ContentType::Text),
        MessageContent::Items(mut items) => {
            if items.is_empty() {
                return Err(BotStreamError::Validation(
                    "object_string message needs at least one item".into(),
                ));
            }
            for item in &mut items {
                if let Some(text) = &item.text {
                    item.text = Some(clean_text(text));
                }
            }
            let encoded = serde_json::to_string::<[ContentItem]>(&items)
                .map_err(|e| BotStreamError::Other(e.into()))?;
            (encoded, ContentType::ObjectString)
        }
    };
    Ok(WireMessage {
        role: msg.role,
        kind: msg.kind,
        content,
        content_type,
        meta_data: msg.meta_data,
    })
}

/// Shape a caller request into the wire body for `bot_id`.
/// An empty user id is replaced with a random one.
pub fn normalize_chat(req: ChatRequest, bot_id: &str) -> CoreResult<WireChatRequest> {
    if bot_id.trim().is_empty() {
        return Err(BotStreamError::Validation("bot_id must not be empty".into()));
    }
    let user_id = if req.user_id.trim().is_empty() {
        uuid::Uuid::new_v4().simple().to_string()
    } else {
        req.user_id
    };
    let additional_messages = req
        .additional_messages
        .into_iter()
        .map(normalize_message)
        .collect::<CoreResult<Vec<_>>>()?;
    Ok(WireChatRequest {
        bot_id: bot_id.to_string(),
        user_id,
        additional_messages,
        stream: req.stream,
        auto_save_history: req.auto_save_history,
        custom_variables: req.custom_variables,
        meta_data: req.meta_data,
    })
}
