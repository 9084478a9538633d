//! Configuration loading, validation, and management for StreamWeave.
//!
//! Loads configuration from `~/.streamweave/config.toml` (or an explicit path)
//! with environment variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use streamweave_core::{ChannelContext, KnowledgeEntry};

/// The root configuration structure.
///
/// Maps directly to `~/.streamweave/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the default provider (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL for the default provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Default model provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Model used when a request asks for "default"
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Max tokens per model response when the request does not set one
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Model client timeout and retry policy
    #[serde(default)]
    pub llm: LlmConfig,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Stream buffer configuration
    #[serde(default)]
    pub stream: StreamConfig,

    /// Assistant identity and history window
    #[serde(default)]
    pub assistant: AssistantConfig,

    /// Persistence backend
    #[serde(default)]
    pub storage: StorageConfig,

    /// Channels seeded into the store at startup
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<ChannelContext>,

    /// Knowledge entries seeded into the store at startup
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub knowledge: Vec<KnowledgeEntry>,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}

fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("llm", &self.llm)
            .field("providers", &self.providers)
            .field("gateway", &self.gateway)
            .field("stream", &self.stream)
            .field("assistant", &self.assistant)
            .field("storage", &self.storage)
            .field("channels", &self.channels.len())
            .field("knowledge", &self.knowledge.len())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Bearer token callers must present. Unset = open access.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Allowed CORS origins. Empty = any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            api_key: None,
            cors_origins: Vec::new(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("port", &self.port)
            .field("host", &self.host)
            .field("api_key", &redact(&self.api_key))
            .field("cors_origins", &self.cors_origins)
            .field("max_body_bytes", &self.max_body_bytes)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Lifetime of a stream record after its last append or mark-done
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// How often a live subscriber re-checks the durable done flag
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How often expired records are purged
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Capacity of the live chunk broadcast channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_ttl_secs() -> u64 {
    300
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_channel_capacity() -> usize {
    1024
}

impl StreamConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    /// Name used in the fallback identity line
    #[serde(default = "default_assistant_name")]
    pub name: String,

    /// Global system prompt used when a channel has none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Trailing session messages loaded into each generation
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

fn default_assistant_name() -> String {
    "Assistant".into()
}
fn default_history_window() -> usize {
    10
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            name: default_assistant_name(),
            system_prompt: None,
            history_window: default_history_window(),
        }
    }
}

/// Which persistence backend holds sessions, channels and knowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackend,

    /// SQLite database URL; defaults to a file in the config directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Memory
}

impl StorageConfig {
    pub fn sqlite_url(&self) -> String {
        self.url.clone().unwrap_or_else(|| {
            format!(
                "sqlite://{}",
                AppConfig::config_dir().join("streamweave.db").display()
            )
        })
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            url: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from `~/.streamweave/config.toml` with env overrides.
    ///
    /// Priority: env vars > config file > defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(None)
    }

    /// Load from `path` if given, else the default location, then apply env
    /// overrides and validate.
    pub fn load_with(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| Self::config_dir().join("config.toml"));
        let mut config = Self::load_from(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (normally the process env).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.api_key.is_none() {
            self.api_key = lookup("STREAMWEAVE_API_KEY").or_else(|| lookup("OPENAI_API_KEY"));
        }
        if self.base_url.is_none() {
            self.base_url = lookup("STREAMWEAVE_BASE_URL").or_else(|| lookup("OPENAI_BASE_URL"));
        }
        if let Some(provider) = lookup("STREAMWEAVE_PROVIDER") {
            self.default_provider = provider;
        }
        if let Some(model) = lookup("STREAMWEAVE_MODEL") {
            self.default_model = model;
        }
        if let Some(key) = lookup("STREAMWEAVE_GATEWAY_KEY") {
            self.gateway.api_key = Some(key);
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".streamweave")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.default_temperature) {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if !(1..=128_000).contains(&self.default_max_tokens) {
            return Err(ConfigError::ValidationError(
                "default_max_tokens must be between 1 and 128000".into(),
            ));
        }
        if self.llm.timeout_secs == 0 {
            return Err(ConfigError::ValidationError("llm.timeout_secs must be > 0".into()));
        }
        if self.stream.ttl_secs == 0 {
            return Err(ConfigError::ValidationError("stream.ttl_secs must be > 0".into()));
        }
        if self.stream.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "stream.poll_interval_ms must be > 0".into(),
            ));
        }
        if self.stream.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "stream.channel_capacity must be > 0".into(),
            ));
        }
        if self.assistant.history_window == 0 {
            return Err(ConfigError::ValidationError(
                "assistant.history_window must be > 0".into(),
            ));
        }
        if let Some(channel) = self.channels.iter().find(|c| c.id.trim().is_empty()) {
            return Err(ConfigError::ValidationError(format!(
                "channel '{}' has an empty id",
                channel.name
            )));
        }
        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            llm: LlmConfig::default(),
            providers: HashMap::new(),
            gateway: GatewayConfig::default(),
            stream: StreamConfig::default(),
            assistant: AssistantConfig::default(),
            storage: StorageConfig::default(),
            channels: Vec::new(),
            knowledge: Vec::new(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
