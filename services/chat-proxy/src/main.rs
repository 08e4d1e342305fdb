//! Chat Proxy
//!
//! Single-binary Rust service that:
//! 1. Serves an OpenAI-compatible `/v1/chat/completions` endpoint
//! 2. Forwards each conversation to the upstream chatbot stream
//! 3. Rotates across a pool of upstream session cookies on rate limits and
//!    invalid sessions
//! 4. Translates upstream deltas back into OpenAI completions or SSE chunks

mod body;
mod config;
mod error;
mod metrics;
mod models;
mod openai;
mod orchestrator;
mod proxy;
#[cfg(test)]
mod testing;
mod tokens;
mod translate;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use cookie_pool::CookiePool;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;
use provider::GetbindTransport;

use crate::body::RequestBodyBuilder;
use crate::config::Config;
use crate::metrics::ServiceMetrics;
use crate::models::ModelRegistry;
use crate::openai::ModelList;
use crate::orchestrator::Orchestrator;
use crate::proxy::ProxyState;

/// How long in-flight requests may keep running after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    metrics: ServiceMetrics,
    pool: Arc<CookiePool>,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_handler))
        .route("/v1/models", get(models_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filter from LOG_LEVEL then RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting chat-proxy");

    // Install before any metric is emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    match &config_path {
        Some(path) => info!(path = %path.display(), "loading configuration"),
        None => info!("no config file, using defaults and environment"),
    }

    let mut config = Config::load(config_path.as_deref()).context("failed to load configuration")?;

    info!(
        listen_addr = %config.server.listen_addr,
        base_url = %config.upstream.base_url,
        proxy = config.upstream.proxy_url.is_some(),
        credentials = config.credentials.cookies.len(),
        models = config.models.len(),
        "configuration loaded"
    );

    let builder = RequestBodyBuilder::from_json(config.chat.pre_messages_json.as_deref())
        .context("pre-messages must be a JSON array of chat messages")?;
    if !builder.pre_messages().is_empty() {
        info!(count = builder.pre_messages().len(), "pre-messages configured");
    }

    let client = GetbindTransport::build_client(
        config.upstream.proxy_url.as_deref(),
        config.upstream.timeout(),
    )
    .context("failed to build upstream HTTP client")?;
    let transport = Arc::new(GetbindTransport::new(
        client,
        &config.upstream.base_url,
        config.upstream.event_buffer,
    ));
    info!(endpoint = %transport.endpoint(), "upstream transport ready");

    let pool = Arc::new(CookiePool::new(
        std::mem::take(&mut config.credentials.cookies),
        config.credentials.lock_duration(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        pool.clone(),
        transport,
        builder,
        config.markers.clone(),
    ));

    let metrics = ServiceMetrics::new();
    let proxy_state = ProxyState {
        orchestrator,
        registry: Arc::new(ModelRegistry::new(config.models.clone())),
        stream_buffer: config.server.stream_buffer,
        requests_total: metrics.requests_total.clone(),
        errors_total: metrics.errors_total.clone(),
    };

    let app_state = AppState {
        proxy: proxy_state,
        metrics,
        pool,
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.server.max_connections);
    let listen_addr = config.server.listen_addr;

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timer starts at signal receipt, not at server start.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

async fn chat_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::chat_completions(&state.proxy, body, request_id).await
}

async fn models_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(ModelList::new(state.proxy.registry.names()))
}

/// Service counters plus the cookie pool report. 503 once no credential is usable.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.pool.health().await;
    let available = pool["credentials_available"].as_u64().unwrap_or(0);
    let status_code = if available > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let status = pool["status"].clone();
    let body = serde_json::json!({
        "status": status,
        "uptime_seconds": state.metrics.started_at.elapsed().as_secs(),
        "requests_served": state.metrics.requests_total.load(Ordering::Relaxed),
        "errors_total": state.metrics.errors_total.load(Ordering::Relaxed),
        "pool": pool,
    });

    (status_code, axum::Json(body))
}

/// Prometheus text exposition.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedTransport, ok, pool, terminal};
    use axum::body::Body;
    use axum::http::Request;
    use cookie_pool::Markers;
    use provider::UpstreamEvent;
    use std::time::Instant;
    use tower::ServiceExt;

    /// Recorder handle without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    fn test_app_state_with(
        pool: Arc<CookiePool>,
        transport: Arc<ScriptedTransport>,
        builder: RequestBodyBuilder,
    ) -> AppState {
        let metrics = ServiceMetrics::new();
        AppState {
            proxy: ProxyState {
                orchestrator: Arc::new(Orchestrator::new(
                    pool.clone(),
                    transport,
                    builder,
                    Markers::default(),
                )),
                registry: Arc::new(ModelRegistry::default()),
                stream_buffer: 8,
                requests_total: metrics.requests_total.clone(),
                errors_total: metrics.errors_total.clone(),
            },
            metrics,
            pool,
            prometheus: test_prometheus_handle(),
        }
    }

    fn test_app(pool: Arc<CookiePool>, transport: Arc<ScriptedTransport>) -> Router {
        build_router(
            test_app_state_with(pool, transport, RequestBodyBuilder::default()),
            1000,
        )
    }

    fn chat_request(body: &str) -> Request<Body> {
        Request::builder()
            .uri("/v1/chat/completions")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    /// JSON payloads of all `data:` frames except `[DONE]`.
    fn sse_payloads(text: &str) -> Vec<serde_json::Value> {
        text.split("\n\n")
            .filter_map(|frame| frame.strip_prefix("data: "))
            .filter(|payload| *payload != "[DONE]")
            .map(|payload| serde_json::from_str(payload).unwrap())
            .collect()
    }

    const HELLO: &str =
        r#"{"model":"claude-3-7-sonnet","messages":[{"role":"user","content":"hi"}]}"#;

    #[tokio::test]
    async fn non_streaming_completion() {
        let transport = Arc::new(ScriptedTransport::default().script("a", ok(&["Hello", " world"])));
        let app = test_app(pool(&["a"]), transport);

        let response = app.oneshot(chat_request(HELLO)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["object"], "chat.completion");
        assert_eq!(json["model"], "claude-3-7-sonnet");
        assert_eq!(json["choices"][0]["message"]["role"], "assistant");
        assert_eq!(json["choices"][0]["message"]["content"], "Hello world");
        assert_eq!(json["choices"][0]["finish_reason"], "stop");
        assert!(json["usage"]["completion_tokens"].as_u64().unwrap() > 0);
        assert!(json["usage"]["prompt_tokens"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn streaming_completion() {
        let transport = Arc::new(ScriptedTransport::default().script("a", ok(&["Hello", " world"])));
        let app = test_app(pool(&["a"]), transport);

        let response = app
            .oneshot(chat_request(
                r#"{"model":"gpt-4o-mini","stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");
        assert_eq!(response.headers()["cache-control"], "no-cache");

        let text = body_text(response).await;
        assert!(text.ends_with("data: [DONE]\n\n"));

        let chunks = sse_payloads(&text);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0]["object"], "chat.completion.chunk");
        assert_eq!(chunks[0]["choices"][0]["delta"]["content"], "Hello");
        assert_eq!(chunks[1]["choices"][0]["delta"]["content"], " world");
        assert_eq!(chunks[2]["choices"][0]["finish_reason"], "stop");
        assert_eq!(chunks[2]["choices"][0]["delta"], serde_json::json!({}));
        assert_eq!(chunks[0]["id"], chunks[2]["id"]);
    }

    #[tokio::test]
    async fn rate_limited_credential_fails_over() {
        for _ in 0..64 {
            let transport = Arc::new(
                ScriptedTransport::default()
                    .script("a", terminal(r#"{"error":"rate limit exceeded"}"#))
                    .script("b", ok(&["ok"])),
            );
            let pool = pool(&["a", "b"]);
            let app = test_app(pool.clone(), transport.clone());

            let response = app.oneshot(chat_request(HELLO)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let json = body_json(response).await;
            assert_eq!(json["choices"][0]["message"]["content"], "ok");
            if transport.user_ids() != ["a", "b"] {
                continue;
            }

            let health = pool.health().await;
            assert_eq!(health["credentials"][0]["status"], "rate_limited");
            assert!(health["credentials"][0]["lock_remaining_secs"].as_u64().unwrap() > 0);
            return;
        }
        panic!("rate-limited credential was never picked first");
    }

    #[tokio::test]
    async fn upstream_error_status_is_500() {
        let transport = Arc::new(ScriptedTransport::default().script(
            "a",
            vec![UpstreamEvent::terminal("<html><body>502 Bad Gateway</body></html>", 502)],
        ));
        let app = test_app(pool(&["a"]), transport);

        let response = app.oneshot(chat_request(HELLO)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "upstream_error");
        assert_eq!(json["error"]["type"], "upstream_error");
    }

    #[tokio::test]
    async fn all_credentials_exhausted_is_503() {
        let transport = Arc::new(
            ScriptedTransport::default()
                .script("a", terminal("rate limit"))
                .script("b", terminal("not login")),
        );
        let app = test_app(pool(&["a", "b"]), transport.clone());

        let response = app.oneshot(chat_request(HELLO)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "cookies_exhausted");
        assert_eq!(
            json["error"]["message"],
            "All cookies are temporarily unavailable."
        );
        assert_eq!(transport.user_ids().len(), 2);
    }

    #[tokio::test]
    async fn streaming_failure_before_first_chunk_is_json_error() {
        let transport = Arc::new(ScriptedTransport::default().script("a", terminal("rate limit")));
        let app = test_app(pool(&["a"]), transport);

        let response = app
            .oneshot(chat_request(
                r#"{"model":"gpt-4o-mini","stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "cookies_exhausted");
    }

    #[tokio::test]
    async fn forbidden_upstream_is_500() {
        let transport = Arc::new(
            ScriptedTransport::default().script("a", vec![UpstreamEvent::terminal("nope", 403)]),
        );
        let app = test_app(pool(&["a"]), transport);

        let response = app.oneshot(chat_request(HELLO)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"]["code"], "forbidden");
    }

    #[tokio::test]
    async fn unknown_model_is_rejected_without_upstream_call() {
        let transport = Arc::new(ScriptedTransport::default());
        let app = test_app(pool(&["a"]), transport.clone());

        let response = app
            .oneshot(chat_request(
                r#"{"model":"gpt-5","messages":[{"role":"user","content":"hi"}]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "invalid_model");
        assert_eq!(json["error"]["message"], "Model gpt-5 not supported");
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn max_tokens_boundary() {
        let transport = Arc::new(ScriptedTransport::default().script("a", ok(&["fine"])));
        let pool = pool(&["a"]);

        let at_limit = r#"{"model":"gpt-4o-mini","max_tokens":128000,"messages":[{"role":"user","content":"hi"}]}"#;
        let response = test_app(pool.clone(), transport.clone())
            .oneshot(chat_request(at_limit))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let over = r#"{"model":"gpt-4o-mini","max_tokens":128001,"messages":[{"role":"user","content":"hi"}]}"#;
        let response = test_app(pool.clone(), transport.clone())
            .oneshot(chat_request(over))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], "invalid_max_tokens");
        assert_eq!(transport.calls().len(), 1);

        let huge = r#"{"model":"gpt-4o-mini","max_tokens":5000000000,"messages":[{"role":"user","content":"hi"}]}"#;
        let response = test_app(pool, transport.clone())
            .oneshot(chat_request(huge))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], "invalid_max_tokens");
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn negative_max_tokens_is_under_the_ceiling() {
        let transport = Arc::new(ScriptedTransport::default().script("a", ok(&["fine"])));
        let body = r#"{"model":"gpt-4o-mini","max_tokens":-1,"messages":[{"role":"user","content":"hi"}]}"#;

        let response = test_app(pool(&["a"]), transport)
            .oneshot(chat_request(body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_body_is_500_request_error() {
        let transport = Arc::new(ScriptedTransport::default());
        let app = test_app(pool(&["a"]), transport.clone());

        let response = app.oneshot(chat_request("{not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "request_error");
        assert_eq!(json["error"]["message"], "Invalid request parameters");
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn messages_are_prepared_before_forwarding() {
        let transport = Arc::new(ScriptedTransport::default().script("a", ok(&["ok"])));
        let builder =
            RequestBodyBuilder::from_json(Some(r#"[{"role":"system","content":"be brief"}]"#))
                .unwrap();
        let app = build_router(
            test_app_state_with(pool(&["a"]), transport.clone(), builder),
            1000,
        );

        let response = app
            .oneshot(chat_request(
                r#"{"model":"claude-3-7-sonnet","messages":[{"role":"system","content":""},{"role":"user","content":"hi"}]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].model, "claude-3.7-sonnet");
        let query: serde_json::Value = serde_json::from_str(&calls[0].query).unwrap();
        assert_eq!(
            query,
            serde_json::json!([
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"}
            ])
        );
    }

    #[tokio::test]
    async fn models_endpoint_lists_registry() {
        let app = test_app(pool(&["a"]), Arc::new(ScriptedTransport::default()));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/models")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["object"], "list");
        let ids: Vec<&str> = json["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert_eq!(
            ids,
            vec![
                "claude-3-7-sonnet",
                "claude-3-7-sonnet-thinking",
                "gpt-4o-mini"
            ]
        );
    }

    #[tokio::test]
    async fn health_reports_counters_and_pool() {
        let state = test_app_state_with(
            pool(&["a", "b"]),
            Arc::new(ScriptedTransport::default()),
            RequestBodyBuilder::default(),
        );
        state.metrics.requests_total.fetch_add(5, Ordering::Relaxed);
        let app = build_router(state, 1000);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["requests_served"], 5);
        assert_eq!(json["pool"]["credentials_total"], 2);
    }

    #[tokio::test]
    async fn health_is_503_when_every_credential_is_rate_limited() {
        let pool = pool(&["a"]);
        let mut rotation = pool.rotation();
        let credential = rotation.pick_random().await.unwrap();
        pool.penalize(&credential, Instant::now() + Duration::from_secs(60))
            .await;

        let app = test_app(pool.clone(), Arc::new(ScriptedTransport::default()));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["status"], "unhealthy");
    }

    #[tokio::test]
    async fn metrics_endpoint_is_prometheus_text() {
        let app = test_app(pool(&["a"]), Arc::new(ScriptedTransport::default()));
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()["content-type"]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
    }
}
