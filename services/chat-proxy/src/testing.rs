//! Scripted upstream for orchestrator and router tests.

use common::Secret;
use cookie_pool::CookiePool;
use provider::{ChatForm, EventStream, Transport, TransportError, UpstreamEvent};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Replays a fixed event script per credential value and records every form.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: HashMap<String, Vec<UpstreamEvent>>,
    connect_error: bool,
    calls: Mutex<Vec<ChatForm>>,
}

impl ScriptedTransport {
    /// Transport whose every connection attempt fails.
    pub fn unreachable() -> Self {
        Self {
            connect_error: true,
            ..Default::default()
        }
    }

    pub fn script(mut self, user_id: &str, events: Vec<UpstreamEvent>) -> Self {
        self.scripts.insert(user_id.to_string(), events);
        self
    }

    pub fn calls(&self) -> Vec<ChatForm> {
        self.calls.lock().unwrap().clone()
    }

    pub fn user_ids(&self) -> Vec<String> {
        self.calls().into_iter().map(|f| f.user_id).collect()
    }
}

impl Transport for ScriptedTransport {
    fn id(&self) -> &str {
        "scripted"
    }

    fn open_stream<'a>(
        &'a self,
        form: &'a ChatForm,
    ) -> Pin<Box<dyn Future<Output = provider::Result<EventStream>> + Send + 'a>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(form.clone());
            if self.connect_error {
                return Err(TransportError::Connect("connection refused".into()));
            }
            let events = self.scripts.get(&form.user_id).cloned().unwrap_or_default();
            let (tx, rx) = mpsc::channel(events.len().max(1));
            for event in events {
                let _ = tx.send(event).await;
            }
            Ok(rx)
        })
    }
}

/// Deltas followed by a normal terminal event.
pub fn ok(text: &[&str]) -> Vec<UpstreamEvent> {
    let mut events: Vec<_> = text.iter().map(|t| UpstreamEvent::delta(*t, 200)).collect();
    events.push(UpstreamEvent::terminal("", 200));
    events
}

/// A lone terminal event carrying `payload`.
pub fn terminal(payload: &str) -> Vec<UpstreamEvent> {
    vec![UpstreamEvent::terminal(payload, 200)]
}

pub fn pool(ids: &[&str]) -> Arc<CookiePool> {
    let values = ids.iter().map(|id| Secret::new(id.to_string())).collect();
    Arc::new(CookiePool::new(values, Duration::from_secs(600)))
}
