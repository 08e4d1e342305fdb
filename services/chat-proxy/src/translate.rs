//! Upstream delta to OpenAI translation
//!
//! A `Translator` is owned by one client request. In buffered mode it
//! accumulates content and produces one `chat.completion` at the end. In
//! streaming mode it writes SSE frames (`data: <json>\n\n`) to a bounded
//! channel drained by the HTTP response body; a full channel blocks the
//! caller, which in turn stops reading from the upstream.

use crate::error::ApiError;
use crate::openai::{
    ASSISTANT_ROLE, AssistantMessage, CHUNK_OBJECT, COMPLETION_OBJECT, ChatCompletion, Choice,
    Delta, Usage,
};
use crate::tokens::count_tokens;
use bytes::Bytes;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Sentinel payload that ends an OpenAI stream. Upstream may send it too.
pub const DONE_MARKER: &str = "[DONE]";

const STOP_REASON: &str = "stop";

/// Whether to keep reading upstream events after a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("client disconnected")]
    ClientGone,

    #[error("failed to encode chunk: {0}")]
    Encode(#[from] serde_json::Error),
}

enum Delivery {
    Buffered { text: String },
    Streamed { tx: mpsc::Sender<Bytes>, emitted: bool },
}

pub struct Translator {
    delivery: Delivery,
    id: String,
    created: i64,
    model: String,
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl Translator {
    /// Translator that returns one completion object from `finish`.
    pub fn buffered(model: &str) -> Self {
        Self::with_delivery(
            model,
            Delivery::Buffered {
                text: String::new(),
            },
        )
    }

    /// Translator that forwards each delta as a chunk frame on `tx`.
    pub fn streaming(model: &str, tx: mpsc::Sender<Bytes>) -> Self {
        Self::with_delivery(model, Delivery::Streamed { tx, emitted: false })
    }

    fn with_delivery(model: &str, delivery: Delivery) -> Self {
        Self {
            delivery,
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().as_simple()),
            created: unix_now(),
            model: model.to_string(),
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }

    /// Whether any frame has reached the client channel.
    pub fn has_emitted(&self) -> bool {
        matches!(self.delivery, Delivery::Streamed { emitted: true, .. })
    }

    /// Reset per-attempt state before a new upstream attempt.
    ///
    /// Buffered content from an abandoned attempt is discarded. Streamed
    /// content has already reached the client and stays counted.
    pub fn begin_attempt(&mut self, prompt: &str) {
        self.prompt_tokens = count_tokens(prompt, &self.model);
        if let Delivery::Buffered { text } = &mut self.delivery {
            text.clear();
            self.completion_tokens = 0;
        }
    }

    pub fn usage(&self) -> Usage {
        Usage::new(self.prompt_tokens, self.completion_tokens)
    }

    /// Resolves once the streaming client has gone away. Never resolves in buffered mode.
    pub async fn closed(&self) {
        match &self.delivery {
            Delivery::Streamed { tx, .. } => tx.closed().await,
            Delivery::Buffered { .. } => std::future::pending().await,
        }
    }

    /// Handle one non-empty upstream delta.
    pub async fn on_delta(&mut self, data: &str) -> Result<Flow, TranslateError> {
        if data == DONE_MARKER {
            return Ok(Flow::Stop);
        }
        self.completion_tokens += count_tokens(data, &self.model);
        if let Delivery::Buffered { text } = &mut self.delivery {
            text.push_str(data);
            return Ok(Flow::Continue);
        }
        let chunk = self.chunk(
            Delta {
                role: Some(ASSISTANT_ROLE.into()),
                content: Some(data.to_string()),
            },
            None,
        );
        let json = serde_json::to_string(&chunk)?;
        self.send(frame(&json)).await?;
        Ok(Flow::Continue)
    }

    /// Complete the response: the aggregated completion in buffered mode,
    /// or the stop chunk and `[DONE]` in streaming mode.
    pub async fn finish(mut self) -> Result<Option<ChatCompletion>, TranslateError> {
        if let Delivery::Buffered { text } = &mut self.delivery {
            let content = std::mem::take(text);
            let usage = Usage::new(self.prompt_tokens, count_tokens(&content, &self.model));
            return Ok(Some(ChatCompletion {
                id: self.id,
                object: COMPLETION_OBJECT.into(),
                created: self.created,
                model: self.model,
                choices: vec![Choice {
                    index: 0,
                    message: Some(AssistantMessage {
                        role: ASSISTANT_ROLE.into(),
                        content,
                    }),
                    delta: None,
                    finish_reason: Some(STOP_REASON.into()),
                }],
                usage,
            }));
        }
        let chunk = self.chunk(Delta::default(), Some(STOP_REASON));
        let json = serde_json::to_string(&chunk)?;
        self.send(frame(&json)).await?;
        self.send(frame(DONE_MARKER)).await?;
        Ok(None)
    }

    /// Deliver `error` in-stream when the client already received chunks.
    ///
    /// Returns false when nothing was emitted yet, leaving the caller to
    /// answer with a regular JSON error response.
    pub async fn fail(&mut self, error: &ApiError) -> bool {
        if !self.has_emitted() {
            return false;
        }
        let Ok(json) = serde_json::to_string(&error.body()) else {
            return false;
        };
        self.send(frame(&json)).await.is_ok() && self.send(frame(DONE_MARKER)).await.is_ok()
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<&str>) -> ChatCompletion {
        ChatCompletion {
            id: self.id.clone(),
            object: CHUNK_OBJECT.into(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: None,
                delta: Some(delta),
                finish_reason: finish_reason.map(String::from),
            }],
            usage: self.usage(),
        }
    }

    async fn send(&mut self, frame: Bytes) -> Result<(), TranslateError> {
        let Delivery::Streamed { tx, emitted } = &mut self.delivery else {
            return Ok(());
        };
        tx.send(frame)
            .await
            .map_err(|_| TranslateError::ClientGone)?;
        *emitted = true;
        Ok(())
    }
}

/// One SSE frame.
pub fn frame(payload: &str) -> Bytes {
    Bytes::from(format!("data: {payload}\n\n"))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
