//! Session cookie pool for the upstream chatbot
//!
//! Holds the configured upstream credentials and their advisory rate-limit
//! state, and classifies terminal upstream payloads into the signals that drive
//! failover. The pool is an explicitly owned value shared through `Arc`; every
//! client request borrows it through its own `Rotation`, which remembers which
//! credentials that request has already tried.
//!
//! Credential lifecycle:
//! 1. Loaded at startup from `USER_ID` or the cookies file, state `Available`
//! 2. A request picks a random starting credential (`Rotation::pick_random`)
//! 3. Upstream reports invalid session or rate limit → request fails over to the
//!    next untried credential in pool order (`Rotation::pick_next`)
//! 4. Rate limit → `CookiePool::penalize` records `RateLimited { until }`
//! 5. Lock expires → cleared lazily the next time the credential is selected

pub mod classify;
pub mod error;
pub mod pool;

pub use classify::{Markers, Signal};
pub use error::{Error, Result};
pub use pool::{CookiePool, Credential, CredentialStatus, Rotation};
