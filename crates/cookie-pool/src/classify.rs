//! Terminal payload classification
//!
//! The upstream ends every stream with a terminal event whose payload either
//! closes the stream normally or embeds an error. Matching is a
//! case-insensitive substring search against configurable marker lists, checked
//! in priority order: server error, then invalid session, then rate limit.

use serde::Deserialize;

/// Outcome signalled by a terminal upstream payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Upstream failed on its side. Fatal, no failover.
    ServerError,
    /// Credential is not (or no longer) logged in. Fail over.
    InvalidSession,
    /// Credential hit its rate limit. Penalize and fail over.
    RateLimited,
    /// No error marker, the stream ended normally.
    Normal,
}

impl Signal {
    /// Whether this signal should move the request to another credential.
    pub fn is_retryable(self) -> bool {
        matches!(self, Signal::InvalidSession | Signal::RateLimited)
    }

    pub fn label(self) -> &'static str {
        match self {
            Signal::ServerError => "server_error",
            Signal::InvalidSession => "invalid_session",
            Signal::RateLimited => "rate_limited",
            Signal::Normal => "normal",
        }
    }
}

/// Marker substrings for each error category.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Markers {
    pub server_error: Vec<String>,
    pub invalid_session: Vec<String>,
    pub rate_limited: Vec<String>,
}

impl Default for Markers {
    fn default() -> Self {
        Self {
            server_error: strings(&[
                "internal server error",
                "service unavailable",
                "\"code\":500",
            ]),
            invalid_session: strings(&[
                "not login",
                "not logged in",
                "unauthorized",
                "invalid user",
                "login required",
            ]),
            rate_limited: strings(&[
                "rate limit",
                "too many requests",
                "limit exceeded",
                "quota exceeded",
            ]),
        }
    }
}

impl Markers {
    /// Classify a terminal payload. Pure: the same payload always yields the same signal.
    pub fn classify(&self, payload: &str) -> Signal {
        let lower = payload.to_lowercase();
        if contains_any(&lower, &self.server_error) {
            Signal::ServerError
        } else if contains_any(&lower, &self.invalid_session) {
            Signal::InvalidSession
        } else if contains_any(&lower, &self.rate_limited) {
            Signal::RateLimited
        } else {
            Signal::Normal
        }
    }
}

fn contains_any(haystack: &str, patterns: &[String]) -> bool {
    patterns
        .iter()
        .filter(|p| !p.is_empty())
        .any(|p| haystack.contains(&p.to_lowercase()))
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}
