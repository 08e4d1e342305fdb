//! Token accounting
//!
//! Counts use the model's tiktoken encoding when one is known, o200k for
//! anything else. Encoders are loaded once per process. If an encoding
//! cannot be loaded the count falls back to one token per four characters.

use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;
use tiktoken_rs::tokenizer::{Tokenizer, get_tokenizer};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Cl100k,
    O200k,
}

impl Encoding {
    pub fn for_model(model: &str) -> Self {
        match get_tokenizer(model) {
            Some(Tokenizer::Cl100kBase) => Encoding::Cl100k,
            _ => Encoding::O200k,
        }
    }
}

static CL100K: OnceLock<Option<CoreBPE>> = OnceLock::new();
static O200K: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn encoder(encoding: Encoding) -> Option<&'static CoreBPE> {
    let cell = match encoding {
        Encoding::Cl100k => &CL100K,
        Encoding::O200k => &O200K,
    };
    cell.get_or_init(|| {
        let loaded = match encoding {
            Encoding::Cl100k => tiktoken_rs::cl100k_base(),
            Encoding::O200k => tiktoken_rs::o200k_base(),
        };
        loaded
            .map_err(|e| warn!(error = %e, ?encoding, "failed to load tokenizer, estimating"))
            .ok()
    })
    .as_ref()
}

/// Number of tokens `text` encodes to under `model`'s encoding.
pub fn count_tokens(text: &str, model: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    match encoder(Encoding::for_model(model)) {
        Some(bpe) => bpe.encode_ordinary(text).len() as u64,
        None => estimate(text),
    }
}

fn estimate(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}
