//! Error types for pool operations

/// Errors from credential selection.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("credential pool is empty")]
    Empty,

    #[error("all {tried} credentials tried for this request")]
    Exhausted { tried: usize },
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
