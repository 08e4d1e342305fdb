//! Getbind chatbot transport
//!
//! Posts the chat form as `multipart/form-data` with browser-style headers and
//! relays the SSE response as `UpstreamEvent`s over a bounded channel. The
//! producer task blocks when the consumer falls behind and exits as soon as
//! the consumer drops its receiver, which drops the upstream connection.

use crate::{ChatForm, EventStream, Result, Transport, TransportError, UpstreamEvent};
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Path of the streaming chat endpoint, relative to the base URL.
pub const CHAT_STREAM_PATH: &str = "/chatbot/stream";

/// Headers the browser client sends with every chat request.
const BROWSER_HEADERS: &[(&str, &str)] = &[
    ("accept", "text/event-stream"),
    ("accept-language", "zh-CN,zh;q=0.9,en;q=0.8"),
    ("origin", "https://copilot.getbind.co"),
    ("priority", "u=1, i"),
    ("referer", "https://copilot.getbind.co/"),
    (
        "sec-ch-ua",
        "\"Google Chrome\";v=\"135\", \"Not-A.Brand\";v=\"8\", \"Chromium\";v=\"135\"",
    ),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", "\"macOS\""),
    ("sec-fetch-dest", "empty"),
    ("sec-fetch-mode", "cors"),
    ("sec-fetch-site", "same-site"),
    (
        "user-agent",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36",
    ),
];

/// Streaming transport for the Getbind chatbot API.
pub struct GetbindTransport {
    client: reqwest::Client,
    endpoint: String,
    event_buffer: usize,
}

impl GetbindTransport {
    /// `event_buffer` bounds how many parsed events may wait for the consumer.
    pub fn new(client: reqwest::Client, base_url: &str, event_buffer: usize) -> Self {
        Self {
            client,
            endpoint: format!("{}{CHAT_STREAM_PATH}", base_url.trim_end_matches('/')),
            event_buffer: event_buffer.max(1),
        }
    }

    /// Build the HTTP client: optional outbound proxy, whole-request timeout.
    pub fn build_client(proxy_url: Option<&str>, timeout: Duration) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(url) = proxy_url {
            let proxy = reqwest::Proxy::all(url)
                .map_err(|e| TransportError::Client(format!("invalid proxy url {url}: {e}")))?;
            builder = builder.proxy(proxy);
        }
        builder
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Transport for GetbindTransport {
    fn id(&self) -> &str {
        "getbind"
    }

    fn open_stream<'a>(
        &'a self,
        form: &'a ChatForm,
    ) -> Pin<Box<dyn Future<Output = Result<EventStream>> + Send + 'a>> {
        Box::pin(async move {
            let mut multipart = reqwest::multipart::Form::new();
            for (name, value) in form.fields() {
                multipart = multipart.text(name, value.to_string());
            }

            let response = self
                .client
                .post(&self.endpoint)
                .headers(browser_headers())
                .multipart(multipart)
                .send()
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;

            let status = response.status().as_u16();
            debug!(status, session_id = %form.session_id, "upstream stream opened");

            let (tx, rx) = mpsc::channel(self.event_buffer);
            tokio::spawn(pump(response, status, tx));
            Ok(rx)
        })
    }
}

fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    for &(name, value) in BROWSER_HEADERS {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    headers
}

/// Relay the upstream body into `tx` until it ends or the receiver goes away.
///
/// Each SSE `data` payload becomes a delta. The stream always closes with one
/// terminal event: empty on a clean end, `UpstreamEvent::failure` when the
/// body breaks, the raw body with its status on a non-2xx response.
async fn pump(response: reqwest::Response, status: u16, tx: mpsc::Sender<UpstreamEvent>) {
    if !response.status().is_success() {
        let body = tokio::select! {
            _ = tx.closed() => return,
            body = response.text() => body.unwrap_or_else(|e| e.to_string()),
        };
        warn!(status, "upstream returned non-success status");
        let _ = tx.send(UpstreamEvent::terminal(body, status)).await;
        return;
    }

    let mut events = response.bytes_stream().eventsource();

    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                debug!("event consumer dropped, closing upstream stream");
                return;
            }
            next = events.next() => next,
        };

        match next {
            Some(Ok(event)) => {
                if tx.send(UpstreamEvent::delta(event.data, status)).await.is_err() {
                    return;
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "upstream body read failed");
                let _ = tx.send(UpstreamEvent::failure(e.to_string())).await;
                return;
            }
            None => break,
        }
    }

    let _ = tx.send(UpstreamEvent::terminal(String::new(), status)).await;
}
