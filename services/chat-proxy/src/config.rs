//! Configuration types and loading
//!
//! Config precedence: env vars > config file > defaults. The config file is
//! optional. Upstream credentials come from `USER_ID` (comma separated) or
//! from `credentials.cookies_file`, never from the TOML itself.

use crate::models::{ModelDescriptor, default_models};
use common::Secret;
use cookie_pool::Markers;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "chat-proxy.toml";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub credentials: CredentialsConfig,
    pub markers: Markers,
    pub chat: ChatConfig,
    /// Replaces the built-in models when non-empty.
    pub models: Vec<ModelDescriptor>,
}

/// Listener settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub max_connections: usize,
    /// Frames buffered between a streaming request and its response body.
    pub stream_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7055)),
            max_connections: 1000,
            stream_buffer: 32,
        }
    }
}

/// Upstream chatbot settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Whole-request timeout. Long because a single answer can stream for a long time.
    pub timeout_secs: u64,
    pub proxy_url: Option<String>,
    /// Parsed upstream events buffered ahead of translation.
    pub event_buffer: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.getbind.co".into(),
            timeout_secs: 36_000,
            proxy_url: None,
            event_buffer: 64,
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Credential source and rate-limit penalty
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// One credential per line, `#` starts a comment.
    pub cookies_file: Option<PathBuf>,
    pub rate_limit_lock_secs: u64,
    #[serde(skip)]
    pub cookies: Vec<Secret<String>>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            cookies_file: None,
            rate_limit_lock_secs: 600,
            cookies: Vec::new(),
        }
    }
}

impl CredentialsConfig {
    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.rate_limit_lock_secs)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// JSON array of messages prepended to every conversation.
    pub pre_messages_json: Option<String>,
}

impl Config {
    /// Load configuration from an optional TOML file, overlay environment
    /// variables, resolve credentials and validate.
    ///
    /// Credential resolution order:
    /// 1. USER_ID env var
    /// 2. cookies_file path from config
    pub fn load(path: Option<&Path>) -> common::Result<Self> {
        let mut config: Config = match path {
            Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
            None => Config::default(),
        };

        config.apply_env()?;
        if config.models.is_empty() {
            config.models = default_models();
        }
        config.credentials.cookies = resolve_credentials(&config.credentials)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> common::Result<()> {
        if let Ok(port) = std::env::var("PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|e| common::Error::config(format!("invalid PORT {port:?}: {e}")))?;
            self.server.listen_addr.set_port(port);
        }
        if let Ok(proxy) = std::env::var("PROXY_URL") {
            let proxy = proxy.trim();
            self.upstream.proxy_url = (!proxy.is_empty()).then(|| proxy.to_string());
        }
        if let Ok(secs) = std::env::var("RATE_LIMIT_COOKIE_LOCK_DURATION") {
            self.credentials.rate_limit_lock_secs = secs.trim().parse().map_err(|e| {
                common::Error::config(format!(
                    "invalid RATE_LIMIT_COOKIE_LOCK_DURATION {secs:?}: {e}"
                ))
            })?;
        }
        if let Ok(json) = std::env::var("PRE_MESSAGES_JSON") {
            self.chat.pre_messages_json = Some(json);
        }
        Ok(())
    }

    fn validate(&self) -> common::Result<()> {
        if !is_http_url(&self.upstream.base_url) {
            return Err(common::Error::config(format!(
                "upstream.base_url must start with http:// or https://, got: {}",
                self.upstream.base_url
            )));
        }
        if let Some(proxy) = &self.upstream.proxy_url
            && !is_http_url(proxy)
        {
            return Err(common::Error::config(format!(
                "proxy_url must start with http:// or https://, got: {proxy}"
            )));
        }
        if self.upstream.timeout_secs == 0 {
            return Err(common::Error::config("timeout_secs must be greater than 0"));
        }
        if self.upstream.event_buffer == 0 {
            return Err(common::Error::config("event_buffer must be greater than 0"));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::config(
                "max_connections must be greater than 0",
            ));
        }
        if self.server.stream_buffer == 0 {
            return Err(common::Error::config("stream_buffer must be greater than 0"));
        }
        if self.credentials.cookies.is_empty() {
            return Err(common::Error::config(
                "no upstream credentials: set USER_ID or credentials.cookies_file",
            ));
        }
        if self.models.is_empty() {
            return Err(common::Error::config("no models configured"));
        }
        Ok(())
    }

    /// Resolve the config file from the CLI arg or CONFIG_PATH env var,
    /// falling back to `chat-proxy.toml` when it exists.
    pub fn resolve_path(cli_path: Option<&str>) -> Option<PathBuf> {
        if let Some(p) = cli_path {
            return Some(PathBuf::from(p));
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return Some(PathBuf::from(p));
        }
        let default = PathBuf::from(DEFAULT_CONFIG_FILE);
        default.exists().then_some(default)
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn resolve_credentials(config: &CredentialsConfig) -> common::Result<Vec<Secret<String>>> {
    if let Ok(ids) = std::env::var("USER_ID") {
        return Ok(split_credentials(&ids, ','));
    }
    match &config.cookies_file {
        Some(path) => {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                common::Error::config(format!(
                    "failed to read cookies_file {}: {e}",
                    path.display()
                ))
            })?;
            Ok(parse_cookies_file(&contents))
        }
        None => Ok(Vec::new()),
    }
}

fn split_credentials(raw: &str, separator: char) -> Vec<Secret<String>> {
    raw.split(separator)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| Secret::new(id.to_string()))
        .collect()
}

fn parse_cookies_file(contents: &str) -> Vec<Secret<String>> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| Secret::new(line.to_string()))
        .collect()
}
