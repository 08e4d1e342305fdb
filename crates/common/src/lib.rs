//! Types shared across the chat proxy workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
