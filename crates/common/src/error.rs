//! Configuration and startup error types

use thiserror::Error;

/// Errors raised while loading or validating service configuration
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Shorthand for a `Config` error built from anything displayable.
    pub fn config(message: impl std::fmt::Display) -> Self {
        Error::Config(message.to_string())
    }
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;
