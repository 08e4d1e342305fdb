//! Chat completion handler
//!
//! Validates the OpenAI request, hands it to the orchestrator and shapes the
//! outcome into either a JSON response or an SSE stream. A streaming request
//! only commits to `200 text/event-stream` once the first frame exists, so
//! failures before any content still get a proper status code.

use crate::error::ApiError;
use crate::metrics;
use crate::models::{ModelDescriptor, ModelRegistry};
use crate::openai::ChatCompletionRequest;
use crate::orchestrator::{Orchestrator, Outcome};
use crate::translate::Translator;
use axum::body::Body;
use axum::http::StatusCode;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, Span, error, info, instrument, warn};

/// Shared state passed to the chat handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<ModelRegistry>,
    pub stream_buffer: usize,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
}

#[instrument(skip_all, fields(request_id = %request_id, model = tracing::field::Empty, stream = tracing::field::Empty))]
pub async fn chat_completions(state: &ProxyState, body: Bytes, request_id: String) -> Response {
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();

    let (model_label, response) = match validate(state, &body) {
        Ok((request, model)) => {
            let span = Span::current();
            span.record("model", model.name.as_str());
            span.record("stream", request.stream);
            let label = model.name.clone();
            (label, dispatch(state, request, model).await)
        }
        Err(err) => ("unknown".to_string(), err.into_response()),
    };

    let status = response.status();
    if !status.is_success() {
        state.errors_total.fetch_add(1, Ordering::Relaxed);
    }
    let elapsed = started.elapsed();
    metrics::record_request(status.as_u16(), &model_label, elapsed.as_secs_f64());
    info!(
        status = status.as_u16(),
        duration_ms = elapsed.as_millis() as u64,
        "request completed"
    );
    response
}

/// Parse and check the request, then apply message preparation.
fn validate(
    state: &ProxyState,
    body: &[u8],
) -> Result<(ChatCompletionRequest, ModelDescriptor), ApiError> {
    let mut request: ChatCompletionRequest = serde_json::from_slice(body).map_err(|e| {
        warn!(error = %e, "malformed request body");
        ApiError::InvalidRequest
    })?;

    let model = state
        .registry
        .get(&request.model)
        .cloned()
        .ok_or_else(|| ApiError::InvalidModel(request.model.clone()))?;

    if let Some(requested) = request.max_tokens
        && requested > i64::from(model.max_tokens)
    {
        return Err(ApiError::InvalidMaxTokens {
            model: model.name,
            requested,
            limit: model.max_tokens,
        });
    }

    state.orchestrator.builder().prepare(&mut request);
    Ok((request, model))
}

async fn dispatch(
    state: &ProxyState,
    request: ChatCompletionRequest,
    model: ModelDescriptor,
) -> Response {
    if request.stream {
        return stream(state, request, model).await;
    }
    let translator = Translator::buffered(&request.model);
    respond(state.orchestrator.run(&request, &model, translator).await)
}

async fn stream(
    state: &ProxyState,
    request: ChatCompletionRequest,
    model: ModelDescriptor,
) -> Response {
    let (tx, mut rx) = mpsc::channel(state.stream_buffer);
    let translator = Translator::streaming(&request.model, tx);
    let orchestrator = state.orchestrator.clone();
    let task = tokio::spawn(
        async move { orchestrator.run(&request, &model, translator).await }.in_current_span(),
    );

    match rx.recv().await {
        Some(first) => sse_response(first, rx),
        // Nothing was emitted: the run is over and its outcome decides the status.
        None => match task.await {
            Ok(outcome) => respond(outcome),
            Err(e) => {
                error!(error = %e, "stream task failed");
                ApiError::Internal("stream task failed".into()).into_response()
            }
        },
    }
}

fn respond(outcome: Outcome) -> Response {
    match outcome {
        Outcome::Completed(completion) => (StatusCode::OK, axum::Json(completion)).into_response(),
        other => other
            .error()
            .unwrap_or_else(|| ApiError::Internal("stream ended without output".into()))
            .into_response(),
    }
}

fn sse_response(first: Bytes, rx: mpsc::Receiver<Bytes>) -> Response {
    let frames = tokio_stream::once(first)
        .chain(ReceiverStream::new(rx))
        .map(Ok::<_, Infallible>);
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/event-stream"), (CACHE_CONTROL, "no-cache")],
        Body::from_stream(frames),
    )
        .into_response()
}
