//! Upstream transport abstraction for the chat proxy
//!
//! Defines the `Transport` trait that decouples the credential-rotation loop
//! from the HTTP mechanics of talking to the upstream chatbot. A transport
//! takes one fully-built `ChatForm` and yields the upstream's server-sent
//! events, in order, over a bounded channel. `GetbindTransport` is the
//! production implementation; tests substitute scripted transports.

pub mod getbind;

pub use getbind::GetbindTransport;

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

/// Status carried by the terminal event of a stream that broke mid-body.
pub const STREAM_ERROR_STATUS: u16 = 502;

/// One unit received from the upstream stream.
///
/// `done` marks the terminal event. On a terminal event `data` is either a
/// normal closing payload or an embedded error to classify; on any other
/// event it is a raw content delta. A terminal `status` of 400 or above
/// means the stream did not end successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamEvent {
    pub data: String,
    pub done: bool,
    pub status: u16,
}

impl UpstreamEvent {
    /// Non-terminal content delta.
    pub fn delta(data: impl Into<String>, status: u16) -> Self {
        Self {
            data: data.into(),
            done: false,
            status,
        }
    }

    /// Terminal event carrying the stream outcome payload.
    pub fn terminal(data: impl Into<String>, status: u16) -> Self {
        Self {
            data: data.into(),
            done: true,
            status,
        }
    }

    /// Terminal event for a body that failed to read or decode.
    pub fn failure(message: impl Into<String>) -> Self {
        Self::terminal(message, STREAM_ERROR_STATUS)
    }

    /// Whether this terminal event reports an unsuccessful upstream response.
    pub fn is_failure(&self) -> bool {
        self.done && self.status >= 400
    }
}

/// Receiving half of an open upstream stream.
///
/// Dropping it cancels the stream: the producer notices the closed channel
/// and releases the upstream connection.
pub type EventStream = mpsc::Receiver<UpstreamEvent>;

/// Outbound chatbot request, sent as `multipart/form-data`.
///
/// Serializes to JSON for prompt token accounting. `Debug` redacts `user_id`,
/// which carries the session credential.
#[derive(Clone, Serialize)]
pub struct ChatForm {
    pub model: String,
    pub query: String,
    pub bot_id: String,
    pub session_id: String,
    pub user_id: String,
    pub files: String,
}

impl ChatForm {
    /// Form fields in wire order.
    pub fn fields(&self) -> [(&'static str, &str); 6] {
        [
            ("model", &self.model),
            ("query", &self.query),
            ("bot_id", &self.bot_id),
            ("session_id", &self.session_id),
            ("user_id", &self.user_id),
            ("files", &self.files),
        ]
    }
}

impl fmt::Debug for ChatForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatForm")
            .field("model", &self.model)
            .field("query_len", &self.query.len())
            .field("bot_id", &self.bot_id)
            .field("session_id", &self.session_id)
            .field("user_id", &"[REDACTED]")
            .field("files", &self.files)
            .finish()
    }
}

/// Failures opening an upstream stream. None of these are retried.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to build upstream client: {0}")]
    Client(String),

    #[error("failed to open upstream stream: {0}")]
    Connect(String),
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Abstraction over the upstream chatbot stream.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    /// Identifier for logging (e.g. "getbind")
    fn id(&self) -> &str;

    /// Send `form` upstream and return the ordered event stream.
    ///
    /// An `Err` means the stream could not be opened at all. Upstream-reported
    /// failures arrive as terminal events on an `Ok` stream instead.
    fn open_stream<'a>(
        &'a self,
        form: &'a ChatForm,
    ) -> Pin<Box<dyn Future<Output = Result<EventStream>> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form() -> ChatForm {
        ChatForm {
            model: "gpt-4o-mini".into(),
            query: r#"[{"role":"user","content":"hi"}]"#.into(),
            bot_id: "661cacc79657814effd8db6c".into(),
            session_id: "a1b2c3d4e5".into(),
            user_id: "uid-secret".into(),
            files: "{}".into(),
        }
    }

    #[test]
    fn fields_are_in_wire_order() {
        let form = form();
        let names: Vec<&str> = form.fields().iter().map(|(name, _)| *name).collect();
        assert_eq!(
            names,
            ["model", "query", "bot_id", "session_id", "user_id", "files"]
        );
        assert_eq!(form.fields()[4].1, "uid-secret");
    }

    #[test]
    fn debug_redacts_user_id() {
        let debug = format!("{:?}", form());
        assert!(!debug.contains("uid-secret"), "got: {debug}");
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn serializes_all_fields_for_token_accounting() {
        let json = serde_json::to_value(form()).unwrap();
        assert_eq!(json["bot_id"], "661cacc79657814effd8db6c");
        assert_eq!(json["files"], "{}");
    }

    #[test]
    fn event_constructors_set_done_flag() {
        assert!(!UpstreamEvent::delta("Hello", 200).done);
        assert!(UpstreamEvent::terminal("", 200).done);
    }

    #[test]
    fn failure_is_terminal_with_error_status() {
        let event = UpstreamEvent::failure("connection reset");
        assert!(event.done);
        assert!(event.is_failure());
        assert_eq!(event.status, STREAM_ERROR_STATUS);
        assert!(UpstreamEvent::terminal("bad gateway", 504).is_failure());
        assert!(!UpstreamEvent::terminal("", 200).is_failure());
        assert!(!UpstreamEvent::delta("", 500).is_failure());
    }
}
