//! Public model registry
//!
//! Maps the model names clients send to the upstream model identifier, the
//! chatbot the request is addressed to, and the max_tokens ceiling.

use serde::Deserialize;
use std::collections::BTreeMap;

/// Chatbot every built-in model is served by.
pub const DEFAULT_BOT_ID: &str = "661cacc79657814effd8db6c";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelDescriptor {
    /// Name exposed to clients.
    pub name: String,
    /// Identifier the upstream expects in the `model` form field.
    pub upstream_model: String,
    #[serde(default = "default_bot_id")]
    pub bot_id: String,
    pub max_tokens: u32,
}

fn default_bot_id() -> String {
    DEFAULT_BOT_ID.to_string()
}

impl ModelDescriptor {
    fn builtin(name: &str, upstream_model: &str, max_tokens: u32) -> Self {
        Self {
            name: name.into(),
            upstream_model: upstream_model.into(),
            bot_id: default_bot_id(),
            max_tokens,
        }
    }
}

/// Models served when the config file has no `[[models]]` table.
pub fn default_models() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor::builtin("gpt-4o-mini", "gpt-4o-mini", 128_000),
        ModelDescriptor::builtin("claude-3-7-sonnet", "claude-3.7-sonnet", 200_000),
        ModelDescriptor::builtin(
            "claude-3-7-sonnet-thinking",
            "claude-3.7-sonnet-et",
            200_000,
        ),
    ]
}

/// Read-only lookup from public name to descriptor, iterated in name order.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelDescriptor>,
}

impl ModelRegistry {
    /// Later descriptors with a duplicate name replace earlier ones.
    pub fn new(models: impl IntoIterator<Item = ModelDescriptor>) -> Self {
        Self {
            models: models
                .into_iter()
                .map(|model| (model.name.clone(), model))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelDescriptor> {
        self.models.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(default_models())
    }
}
