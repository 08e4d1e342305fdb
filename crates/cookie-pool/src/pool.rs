//! Credential pool and per-request rotation
//!
//! The pool owns the configured credentials and an advisory rate-limit table.
//! Rate limits never exclude a credential from selection: a fresh request may
//! still start on a penalized cookie, and upstream will tell us again if it is
//! still limited. Expired entries are dropped the next time the credential is
//! selected or reported on.
//!
//! All mutable state sits behind one `Mutex`, held only for the map update and
//! never across upstream I/O.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use common::Secret;
use rand::RngExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Availability of a credential.
///
/// Transitions:
/// - Available → RateLimited (upstream rate-limit signal)
/// - RateLimited → Available (lock expired, observed lazily)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialStatus {
    Available,
    RateLimited { until: Instant },
}

impl CredentialStatus {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            CredentialStatus::Available => "available",
            CredentialStatus::RateLimited { .. } => "rate_limited",
        }
    }
}

/// An upstream session credential, identified in logs by its pool position.
#[derive(Clone)]
pub struct Credential {
    index: usize,
    value: Secret<String>,
}

impl Credential {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Log-safe name, e.g. `cookie-2`.
    pub fn label(&self) -> String {
        format!("cookie-{}", self.index)
    }

    /// Raw credential value for the outbound request.
    pub fn expose(&self) -> &str {
        self.value.expose()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.label())
    }
}

/// Shared pool of upstream credentials.
pub struct CookiePool {
    credentials: Vec<Credential>,
    locks: Mutex<HashMap<usize, Instant>>,
    lock_duration: Duration,
}

impl CookiePool {
    /// Create a pool in configuration order. All credentials start Available.
    pub fn new(values: Vec<Secret<String>>, lock_duration: Duration) -> Self {
        let credentials: Vec<Credential> = values
            .into_iter()
            .enumerate()
            .map(|(index, value)| Credential { index, value })
            .collect();
        info!(
            credentials = credentials.len(),
            lock_secs = lock_duration.as_secs(),
            "cookie pool initialized"
        );
        Self {
            credentials,
            locks: Mutex::new(HashMap::new()),
            lock_duration,
        }
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// How long a rate-limited credential stays penalized.
    pub fn lock_duration(&self) -> Duration {
        self.lock_duration
    }

    /// Start a selection sequence for one client request.
    pub fn rotation(&self) -> Rotation<'_> {
        Rotation {
            pool: self,
            tried: vec![false; self.credentials.len()],
            current: None,
        }
    }

    /// Record that `credential` is rate limited until `until`.
    ///
    /// Advisory only: the credential stays selectable. A later deadline never
    /// gets shortened by an earlier one.
    pub async fn penalize(&self, credential: &Credential, until: Instant) {
        let mut locks = self.locks.lock().await;
        let entry = locks.entry(credential.index).or_insert(until);
        if until > *entry {
            *entry = until;
        }
        let remaining = entry.saturating_duration_since(Instant::now());
        drop(locks);

        metrics::counter!("cookie_pool_penalties_total").increment(1);
        info!(
            credential = %credential.label(),
            lock_secs = remaining.as_secs(),
            "credential rate limited"
        );
    }

    /// Current status of `credential`, clearing an expired lock.
    pub async fn status(&self, credential: &Credential) -> CredentialStatus {
        self.observe(credential.index).await
    }

    async fn observe(&self, index: usize) -> CredentialStatus {
        let mut locks = self.locks.lock().await;
        match locks.get(&index).copied() {
            Some(until) if Instant::now() < until => CredentialStatus::RateLimited { until },
            Some(_) => {
                locks.remove(&index);
                info!(credential = index, "rate limit expired, credential available again");
                CredentialStatus::Available
            }
            None => CredentialStatus::Available,
        }
    }

    /// Pool health summary for the health endpoint.
    ///
    /// Status mapping: all available → healthy, some available → degraded,
    /// none available → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let locks = self.locks.lock().await;
        let now = Instant::now();

        let mut credentials = Vec::with_capacity(self.credentials.len());
        let mut available = 0usize;
        let mut rate_limited = 0usize;

        for credential in &self.credentials {
            match locks.get(&credential.index) {
                Some(until) if *until > now => {
                    rate_limited += 1;
                    credentials.push(serde_json::json!({
                        "id": credential.label(),
                        "status": "rate_limited",
                        "lock_remaining_secs": (*until - now).as_secs(),
                    }));
                }
                _ => {
                    available += 1;
                    credentials.push(serde_json::json!({
                        "id": credential.label(),
                        "status": "available",
                    }));
                }
            }
        }

        let total = self.credentials.len();
        let status = if total > 0 && available == total {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "credentials_total": total,
            "credentials_available": available,
            "credentials_rate_limited": rate_limited,
            "credentials": credentials,
        })
    }
}

/// Selection state for a single client request.
///
/// Guarantees no credential is handed out twice, so the number of attempts a
/// request can make is bounded by the pool size.
pub struct Rotation<'a> {
    pool: &'a CookiePool,
    tried: Vec<bool>,
    current: Option<usize>,
}

impl Rotation<'_> {
    /// Pick the starting credential uniformly at random among untried ones.
    ///
    /// Rate-limit state does not exclude anything here; it is only logged.
    pub async fn pick_random(&mut self) -> Result<Credential> {
        if self.pool.is_empty() {
            return Err(Error::Empty);
        }
        let untried: Vec<usize> = (0..self.tried.len()).filter(|i| !self.tried[*i]).collect();
        if untried.is_empty() {
            return Err(Error::Exhausted {
                tried: self.tried_count(),
            });
        }
        let index = untried[rand::rng().random_range(0..untried.len())];
        Ok(self.take(index).await)
    }

    /// Advance to the next untried credential in pool order.
    pub async fn pick_next(&mut self) -> Result<Credential> {
        let n = self.tried.len();
        if n == 0 {
            return Err(Error::Empty);
        }
        let start = self.current.map_or(0, |c| c + 1);
        let next = (0..n).map(|offset| (start + offset) % n).find(|i| !self.tried[*i]);
        match next {
            Some(index) => Ok(self.take(index).await),
            None => Err(Error::Exhausted {
                tried: self.tried_count(),
            }),
        }
    }

    /// Number of distinct credentials handed out so far.
    pub fn tried_count(&self) -> usize {
        self.tried.iter().filter(|t| **t).count()
    }

    async fn take(&mut self, index: usize) -> Credential {
        self.tried[index] = true;
        self.current = Some(index);
        let credential = self.pool.credentials[index].clone();
        if let CredentialStatus::RateLimited { until } = self.pool.observe(index).await {
            debug!(
                credential = %credential.label(),
                lock_remaining_secs = until.saturating_duration_since(Instant::now()).as_secs(),
                "selected credential is still marked rate limited"
            );
        }
        credential
    }
}
