//! Upstream request body construction
//!
//! `prepare` normalizes the client's messages once per request; `build`
//! produces a fresh `ChatForm` for each attempt so every attempt carries its
//! own credential and session id.

use crate::models::ModelDescriptor;
use crate::openai::{ChatCompletionRequest, ChatMessage};
use cookie_pool::Credential;
use provider::ChatForm;
use rand::RngExt;

pub const SESSION_ID_LEN: usize = 10;
const SESSION_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// The upstream expects an attachment map even when there are none.
pub const EMPTY_FILES: &str = "{}";

#[derive(Debug, Clone, Default)]
pub struct RequestBodyBuilder {
    pre_messages: Vec<ChatMessage>,
}

impl RequestBodyBuilder {
    pub fn new(pre_messages: Vec<ChatMessage>) -> Self {
        Self { pre_messages }
    }

    /// Parse configured pre-messages from a JSON array of chat messages.
    pub fn from_json(json: Option<&str>) -> serde_json::Result<Self> {
        let pre_messages = match json.map(str::trim) {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
            _ => Vec::new(),
        };
        Ok(Self::new(pre_messages))
    }

    pub fn pre_messages(&self) -> &[ChatMessage] {
        &self.pre_messages
    }

    /// Drop messages with empty content, then prepend the configured pre-messages.
    pub fn prepare(&self, request: &mut ChatCompletionRequest) {
        request.messages.retain(|message| !message.content.is_empty());
        if !self.pre_messages.is_empty() {
            request
                .messages
                .splice(0..0, self.pre_messages.iter().cloned());
        }
    }

    /// Form for one attempt against `credential`.
    pub fn build(
        &self,
        request: &ChatCompletionRequest,
        model: &ModelDescriptor,
        credential: &Credential,
    ) -> serde_json::Result<ChatForm> {
        Ok(ChatForm {
            model: model.upstream_model.clone(),
            query: serde_json::to_string(&request.messages)?,
            bot_id: model.bot_id.clone(),
            session_id: session_id(),
            user_id: credential.expose().to_string(),
            files: EMPTY_FILES.to_string(),
        })
    }
}

/// Random lowercase alphanumeric session id.
pub fn session_id() -> String {
    let mut rng = rand::rng();
    (0..SESSION_ID_LEN)
        .map(|_| SESSION_ID_CHARSET[rng.random_range(0..SESSION_ID_CHARSET.len())] as char)
        .collect()
}
