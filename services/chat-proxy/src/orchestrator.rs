//! Credential-rotation state machine
//!
//! One run per client request. The run starts on a random credential and
//! walks the pool in order on invalid-session or rate-limit signals, trying
//! each credential at most once:
//!
//! ```text
//! Attempting(cred) --delta--------------------> Attempting(cred)
//! Attempting(cred) --normal end---------------> Completed
//! Attempting(cred) --session / rate limit-----> Retrying(cred, signal)
//! Attempting(cred) --403 / server / transport-> Failed
//! Attempting(cred) --error status / truncated-> Failed
//! Retrying         --next untried credential--> Attempting(next)
//! Retrying         --pool exhausted-----------> Failed(ServiceUnavailable)
//! ```
//!
//! A client disconnect in any state ends the run as `Cancelled` and drops
//! the upstream stream.

use crate::body::RequestBodyBuilder;
use crate::error::ApiError;
use crate::metrics;
use crate::models::ModelDescriptor;
use crate::openai::{ChatCompletion, ChatCompletionRequest};
use crate::translate::{Flow, TranslateError, Translator};
use cookie_pool::{CookiePool, Credential, Markers, Signal};
use provider::Transport;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

const FORBIDDEN_STATUS: u16 = 403;

/// How a run ended.
#[derive(Debug)]
pub enum Outcome {
    /// Buffered mode: the aggregated completion.
    Completed(ChatCompletion),
    /// Streaming mode: chunks, stop chunk and `[DONE]` were all delivered.
    StreamedAndTerminated,
    /// Fatal upstream or internal failure.
    Failed(ApiError),
    /// Every credential was tried without success.
    ServiceUnavailable,
    /// The client went away.
    Cancelled,
}

impl Outcome {
    /// Error to report to the client, if any.
    pub fn error(&self) -> Option<ApiError> {
        match self {
            Outcome::Failed(err) => Some(err.clone()),
            Outcome::ServiceUnavailable => Some(ApiError::CookiesExhausted),
            Outcome::Cancelled => Some(ApiError::Internal("client disconnected".into())),
            Outcome::Completed(_) | Outcome::StreamedAndTerminated => None,
        }
    }
}

enum Phase {
    Attempting(Credential),
    Retrying { credential: Credential, signal: Signal },
    Completed,
    Failed(Outcome),
}

pub struct Orchestrator {
    pool: Arc<CookiePool>,
    transport: Arc<dyn Transport>,
    builder: RequestBodyBuilder,
    markers: Markers,
}

impl Orchestrator {
    pub fn new(
        pool: Arc<CookiePool>,
        transport: Arc<dyn Transport>,
        builder: RequestBodyBuilder,
        markers: Markers,
    ) -> Self {
        Self {
            pool,
            transport,
            builder,
            markers,
        }
    }

    pub fn builder(&self) -> &RequestBodyBuilder {
        &self.builder
    }

    /// Drive `request` to completion, rotating credentials as needed.
    ///
    /// `request` must already be validated and prepared.
    #[instrument(skip_all, fields(model = %model.name, transport = self.transport.id()))]
    pub async fn run(
        &self,
        request: &ChatCompletionRequest,
        model: &ModelDescriptor,
        mut translator: Translator,
    ) -> Outcome {
        let max_attempts = self.pool.len();
        let mut rotation = self.pool.rotation();
        let mut attempt = 0usize;

        let mut phase = match rotation.pick_random().await {
            Ok(credential) => Phase::Attempting(credential),
            Err(e) => {
                error!(error = %e, "no credential available");
                Phase::Failed(Outcome::ServiceUnavailable)
            }
        };

        loop {
            phase = match phase {
                Phase::Attempting(credential) => {
                    attempt += 1;
                    self.attempt(request, model, credential, attempt, max_attempts, &mut translator)
                        .await
                }
                Phase::Retrying { credential, signal } => {
                    if signal == Signal::RateLimited {
                        let until = Instant::now() + self.pool.lock_duration();
                        self.pool.penalize(&credential, until).await;
                    }
                    metrics::record_failover(signal.label());
                    match rotation.pick_next().await {
                        Ok(next) => {
                            warn!(
                                from = %credential.label(),
                                to = %next.label(),
                                reason = signal.label(),
                                attempt,
                                max_attempts,
                                "failing over to next credential"
                            );
                            Phase::Attempting(next)
                        }
                        Err(e) => {
                            error!(error = %e, attempts = attempt, "all credentials failed");
                            Phase::Failed(Outcome::ServiceUnavailable)
                        }
                    }
                }
                Phase::Completed => return Self::complete(translator).await,
                Phase::Failed(outcome) => return Self::abort(outcome, &mut translator).await,
            };
        }
    }

    async fn attempt(
        &self,
        request: &ChatCompletionRequest,
        model: &ModelDescriptor,
        credential: Credential,
        attempt: usize,
        max_attempts: usize,
        translator: &mut Translator,
    ) -> Phase {
        let form = match self.builder.build(request, model, &credential) {
            Ok(form) => form,
            Err(e) => return internal(format!("failed to encode messages: {e}")),
        };
        let prompt = match serde_json::to_string(&form) {
            Ok(prompt) => prompt,
            Err(e) => return internal(format!("failed to encode request: {e}")),
        };
        translator.begin_attempt(&prompt);

        debug!(
            credential = %credential.label(),
            attempt,
            max_attempts,
            session_id = %form.session_id,
            "opening upstream stream"
        );
        let mut events = match self.transport.open_stream(&form).await {
            Ok(events) => events,
            Err(e) => {
                error!(error = %e, credential = %credential.label(), "upstream transport failed");
                metrics::record_upstream_error("transport");
                return Phase::Failed(Outcome::Failed(ApiError::Upstream(e.to_string())));
            }
        };

        loop {
            let event = tokio::select! {
                biased;
                _ = translator.closed() => {
                    info!("client disconnected, abandoning upstream stream");
                    return Phase::Failed(Outcome::Cancelled);
                }
                event = events.recv() => event,
            };

            let Some(event) = event else {
                error!(credential = %credential.label(), "upstream stream ended without a terminal event");
                metrics::record_upstream_error("truncated");
                return Phase::Failed(Outcome::Failed(ApiError::Upstream(
                    "upstream stream ended unexpectedly".into(),
                )));
            };

            if event.status == FORBIDDEN_STATUS {
                error!(credential = %credential.label(), "upstream rejected the request");
                metrics::record_upstream_error("forbidden");
                return Phase::Failed(Outcome::Failed(ApiError::Forbidden));
            }

            if event.done {
                return match self.markers.classify(&event.data) {
                    Signal::ServerError => {
                        error!(payload = %event.data, status = event.status, "upstream server error");
                        metrics::record_upstream_error("server_error");
                        Phase::Failed(Outcome::Failed(ApiError::UpstreamServer))
                    }
                    signal @ (Signal::InvalidSession | Signal::RateLimited) => {
                        warn!(
                            credential = %credential.label(),
                            signal = signal.label(),
                            attempt,
                            max_attempts,
                            "credential rejected by upstream"
                        );
                        Phase::Retrying { credential, signal }
                    }
                    Signal::Normal if event.is_failure() => {
                        error!(payload = %event.data, status = event.status, "upstream request failed");
                        metrics::record_upstream_error("status");
                        Phase::Failed(Outcome::Failed(ApiError::Upstream(format!(
                            "upstream responded with status {}",
                            event.status
                        ))))
                    }
                    Signal::Normal => Phase::Completed,
                };
            }

            if event.data.is_empty() {
                continue;
            }
            debug!(delta = %event.data, "upstream delta");

            match translator.on_delta(&event.data).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => return Phase::Completed,
                Err(TranslateError::ClientGone) => {
                    info!("client disconnected mid-stream");
                    return Phase::Failed(Outcome::Cancelled);
                }
                Err(e) => return internal(e.to_string()),
            }
        }
    }

    async fn complete(translator: Translator) -> Outcome {
        match translator.finish().await {
            Ok(Some(completion)) => Outcome::Completed(completion),
            Ok(None) => Outcome::StreamedAndTerminated,
            Err(TranslateError::ClientGone) => Outcome::Cancelled,
            Err(e) => {
                error!(error = %e, "failed to finish response");
                Outcome::Failed(ApiError::Internal(e.to_string()))
            }
        }
    }

    async fn abort(outcome: Outcome, translator: &mut Translator) -> Outcome {
        if let Some(err) = outcome.error()
            && !matches!(outcome, Outcome::Cancelled)
            && translator.fail(&err).await
        {
            debug!(code = err.code(), "error delivered in-stream");
        }
        outcome
    }
}

fn internal(message: String) -> Phase {
    error!(error = %message, "request translation failed");
    Phase::Failed(Outcome::Failed(ApiError::Internal(message)))
}
