//! TOML Configuration File Support
//!
//! Centralized configuration loading for the chat client, supporting a TOML
//! file at `~/.config/gateway-chat/config.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (applied by the binary through [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [gateway]
//! base_url = "https://gateway.example.com/api"
//! completions_path = "/chat/completions"
//! connect_timeout_ms = 5000
//!
//! [chat]
//! model = "gpt-4"
//! system_prompt = "You are a helpful assistant."
//! temperature = 0.7
//! context_messages = 10
//!
//! [persistence]
//! namespace = "chat-store"
//! ttl_secs = 86400
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::streaming::DEFAULT_MAX_LINE_BYTES;

/// Default gateway root
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/api";

/// Default assistant text shown when a response fails
pub const DEFAULT_FALLBACK_MESSAGE: &str = "Sorry, an error occurred. Please try again.";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Gateway section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayToml {
    /// Gateway root URL
    pub base_url: Option<String>,
    /// Streaming completions path
    pub completions_path: Option<String>,
    /// Health probe path
    pub health_path: Option<String>,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
    /// Longest accepted event-stream line
    pub max_line_bytes: Option<usize>,
    /// Buffered tokens per stream
    pub channel_capacity: Option<usize>,
}

/// Chat section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatToml {
    /// Model identifier
    pub model: Option<String>,
    /// System prompt sent ahead of the history
    pub system_prompt: Option<String>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Upper bound on generated tokens
    pub max_tokens: Option<u32>,
    /// Nucleus sampling cutoff
    pub top_p: Option<f32>,
    /// Prior messages included with each request
    pub context_messages: Option<usize>,
    /// Create a conversation when sending with none active
    pub create_on_send: Option<bool>,
    /// Characters kept in a derived title
    pub title_max_chars: Option<usize>,
    /// Assistant text shown on failure
    pub fallback_message: Option<String>,
}

/// Persistence section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceToml {
    /// Key namespace
    pub namespace: Option<String>,
    /// Entry lifetime in seconds
    pub ttl_secs: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientToml {
    /// Gateway configuration section
    pub gateway: GatewayToml,
    /// Chat configuration section
    pub chat: ChatToml,
    /// Persistence configuration section
    pub persistence: PersistenceToml,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// HTTP gateway settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Gateway root URL
    pub base_url: String,
    /// Streaming completions path
    pub completions_path: String,
    /// Health probe path
    pub health_path: String,
    /// Connection establishment timeout (there is no overall request timeout)
    pub connect_timeout: Duration,
    /// Longest accepted event-stream line
    pub max_line_bytes: usize,
    /// Buffered tokens per stream
    pub channel_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            completions_path: "/chat/completions".to_string(),
            health_path: "/health".to_string(),
            connect_timeout: Duration::from_millis(10_000),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            channel_capacity: 100,
        }
    }
}

impl GatewayConfig {
    /// Gateway config rooted at a URL
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

/// Conversation and request settings
#[derive(Clone, Debug, PartialEq)]
pub struct ChatConfig {
    /// Model identifier
    pub model: String,
    /// System prompt sent ahead of the history
    pub system_prompt: Option<String>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Upper bound on generated tokens
    pub max_tokens: Option<u32>,
    /// Nucleus sampling cutoff
    pub top_p: Option<f32>,
    /// Prior messages included with each request
    pub context_messages: usize,
    /// Create a conversation when sending with none active
    pub create_on_send: bool,
    /// Characters kept in a derived title
    pub title_max_chars: usize,
    /// Assistant text shown on failure
    pub fallback_message: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4".to_string(),
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            top_p: None,
            context_messages: 10,
            create_on_send: true,
            title_max_chars: 30,
            fallback_message: DEFAULT_FALLBACK_MESSAGE.to_string(),
        }
    }
}

/// Snapshot persistence settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistenceConfig {
    /// Key namespace
    pub namespace: String,
    /// Entry lifetime (collaborator default when `None`)
    pub ttl: Option<Duration>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            namespace: "chat-store".to_string(),
            ttl: None,
        }
    }
}

/// Centralized configuration for the chat client
#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    /// Gateway settings
    pub gateway: GatewayConfig,
    /// Chat settings
    pub chat: ChatConfig,
    /// Persistence settings
    pub persistence: PersistenceConfig,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl ClientConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.gateway.base_url.trim();
        if url.is_empty() {
            return Err(ConfigError::ValidationError(
                "gateway.base_url must not be empty".to_string(),
            ));
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::ValidationError(format!(
                "gateway.base_url must start with http:// or https:// (got {url})"
            )));
        }
        if self.gateway.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "gateway.channel_capacity must be greater than 0".to_string(),
            ));
        }
        if self.gateway.max_line_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "gateway.max_line_bytes must be greater than 0".to_string(),
            ));
        }
        if self.chat.title_max_chars == 0 {
            return Err(ConfigError::ValidationError(
                "chat.title_max_chars must be greater than 0".to_string(),
            ));
        }
        if let Some(temperature) = self.chat.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(ConfigError::ValidationError(format!(
                    "chat.temperature must be between 0 and 2 (got {temperature})"
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/gateway-chat/config.toml` or
/// `~/.config/gateway-chat/config.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("gateway-chat").join("config.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or the
/// merged values fail validation. A missing config file is not an error.
pub fn load_config() -> Result<ClientConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed, or
/// the merged values fail validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ClientConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration with an explicit environment lookup
///
/// # Errors
///
/// Same as [`load_config_from_path`].
pub fn load_config_with_env<F>(path: Option<PathBuf>, env: F) -> Result<ClientConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = ClientConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ClientToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);
    config.validate()?;

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut ClientConfig, toml: &ClientToml) {
    let gateway = &toml.gateway;
    if let Some(ref url) = gateway.base_url {
        config.gateway.base_url = url.clone();
    }
    if let Some(ref path) = gateway.completions_path {
        config.gateway.completions_path = path.clone();
    }
    if let Some(ref path) = gateway.health_path {
        config.gateway.health_path = path.clone();
    }
    if let Some(ms) = gateway.connect_timeout_ms {
        config.gateway.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(bytes) = gateway.max_line_bytes {
        config.gateway.max_line_bytes = bytes;
    }
    if let Some(capacity) = gateway.channel_capacity {
        config.gateway.channel_capacity = capacity;
    }

    let chat = &toml.chat;
    if let Some(ref model) = chat.model {
        config.chat.model = model.clone();
    }
    if chat.system_prompt.is_some() {
        config.chat.system_prompt = chat.system_prompt.clone();
    }
    if chat.temperature.is_some() {
        config.chat.temperature = chat.temperature;
    }
    if chat.max_tokens.is_some() {
        config.chat.max_tokens = chat.max_tokens;
    }
    if chat.top_p.is_some() {
        config.chat.top_p = chat.top_p;
    }
    if let Some(n) = chat.context_messages {
        config.chat.context_messages = n;
    }
    if let Some(create) = chat.create_on_send {
        config.chat.create_on_send = create;
    }
    if let Some(n) = chat.title_max_chars {
        config.chat.title_max_chars = n;
    }
    if let Some(ref message) = chat.fallback_message {
        config.chat.fallback_message = message.clone();
    }

    if let Some(ref namespace) = toml.persistence.namespace {
        config.persistence.namespace = namespace.clone();
    }
    if let Some(secs) = toml.persistence.ttl_secs {
        config.persistence.ttl = Some(Duration::from_secs(secs));
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config<F>(config: &mut ClientConfig, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = env("CHAT_GATEWAY_URL") {
        config.gateway.base_url = url;
        config.source = ConfigSource::Env;
    }
    if let Some(model) = env("CHAT_MODEL") {
        config.chat.model = model;
        config.source = ConfigSource::Env;
    }
    if let Some(prompt) = env("CHAT_SYSTEM_PROMPT") {
        config.chat.system_prompt = Some(prompt);
        config.source = ConfigSource::Env;
    }
    if let Some(n) = env("CHAT_CONTEXT_MESSAGES").and_then(|v| v.parse::<usize>().ok()) {
        config.chat.context_messages = n;
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = env("CHAT_CONNECT_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
        config.gateway.connect_timeout = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Gateway URL override
    pub base_url: Option<String>,
    /// Model override
    pub model: Option<String>,
    /// System prompt override
    pub system_prompt: Option<String>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set gateway URL override
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Set model override
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set system prompt override
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Apply overrides to a configuration and revalidate
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if an override is invalid.
    pub fn apply(&self, config: &mut ClientConfig) -> Result<(), ConfigError> {
        if self.base_url.is_some() || self.model.is_some() || self.system_prompt.is_some() {
            config.source = ConfigSource::Cli;
        }
        if let Some(ref url) = self.base_url {
            config.gateway.base_url = url.clone();
        }
        if let Some(ref model) = self.model {
            config.chat.model = model.clone();
        }
        if let Some(ref prompt) = self.system_prompt {
            config.chat.system_prompt = Some(prompt.clone());
        }
        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
