//! Configuration loading, validation, and management for fastrag.
//!
//! Loads configuration from `~/.fastrag/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use fastrag_core::ProviderConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.fastrag/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// System preamble placed at the top of every prompt
    #[serde(default = "default_system_preamble")]
    pub system_preamble: String,

    /// Active LLM provider and its limits
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Context retrieval tuning
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Provider retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Embedding backend for the index
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Conversation and note storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// HTTP gateway
    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_system_preamble() -> String {
    "You are a helpful AI assistant. Answer the user's questions clearly and concisely.".into()
}

/// How retrieved notes and history turns are ranked against each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Top notes pulled from the index per turn
    #[serde(default = "default_k_notes")]
    pub k_notes: usize,

    /// Most recent turns pulled from history per turn
    #[serde(default = "default_k_history")]
    pub k_history: usize,

    /// Multiplier applied to note cosine similarity
    #[serde(default = "default_similarity_weight")]
    pub similarity_weight: f32,

    /// Fixed score for history turns
    #[serde(default = "default_history_baseline")]
    pub history_baseline: f32,

    /// Score subtracted per turn of age (0 = no decay)
    #[serde(default)]
    pub recency_decay: f32,

    /// Notes scoring below this are dropped
    #[serde(default)]
    pub min_note_score: f32,
}

fn default_k_notes() -> usize {
    4
}
fn default_k_history() -> usize {
    6
}
fn default_similarity_weight() -> f32 {
    1.0
}
fn default_history_baseline() -> f32 {
    0.8
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k_notes: default_k_notes(),
            k_history: default_k_history(),
            similarity_weight: default_similarity_weight(),
            history_baseline: default_history_baseline(),
            recency_decay: 0.0,
            min_note_score: 0.0,
        }
    }
}

/// Retry behaviour for transient provider failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts for unavailable/rate-limited calls, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Wait used when a rate-limit response carries no Retry-After
    #[serde(default = "default_rate_limit_secs")]
    pub default_rate_limit_secs: u64,

    /// Extra attempts after a timeout
    #[serde(default = "default_timeout_retries")]
    pub timeout_retries: u32,
}

fn default_max_attempts() -> u32 {
    4
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_rate_limit_secs() -> u64 {
    5
}
fn default_timeout_retries() -> u32 {
    1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            default_rate_limit_secs: default_rate_limit_secs(),
            timeout_retries: default_timeout_retries(),
        }
    }
}

impl RetryConfig {
    /// Longest a retried generation call can take: every attempt the policy
    /// allows at `per_attempt`, plus the longest wait before each retry.
    pub fn generation_deadline(&self, per_attempt: Duration) -> Duration {
        let attempts = self.max_attempts.max(1).saturating_add(self.timeout_retries);
        let waits = Duration::from_millis(self.max_delay_ms).saturating_mul(attempts - 1);
        per_attempt.saturating_mul(attempts).saturating_add(waits)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// "hash" (local, deterministic) or "openai" (remote /embeddings)
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Environment variable holding the key for remote embedders
    #[serde(default = "default_embedding_key_ref")]
    pub api_key_ref: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
}

fn default_embedding_provider() -> String {
    "hash".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_dimensions() -> usize {
    256
}
fn default_embedding_key_ref() -> String {
    "OPENAI_API_KEY".into()
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dimensions: default_dimensions(),
            api_key_ref: default_embedding_key_ref(),
            api_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "sqlite" or "memory"
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    #[serde(default = "default_database_url")]
    pub database_url: String,
}

fn default_storage_backend() -> String {
    "sqlite".into()
}
fn default_database_url() -> String {
    "sqlite://fast_rag.sqlite3".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            database_url: default_database_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Seconds a single turn may take before it fails with ProviderTimeout.
    /// Unset means the full retry budget of the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_timeout_secs: Option<u64>,

    /// Browser origins allowed by CORS
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".into()]
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            turn_timeout_secs: None,
            cors_origins: default_cors_origins(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.fastrag/config.toml),
    /// then apply environment variable overrides.
    ///
    /// A `.env` file in the working directory (or a parent) is loaded into
    /// the process environment first. Variables already set win.
    pub fn load() -> Result<Self, ConfigError> {
        load_dotenv(None)?;
        let config_path = Self::config_dir().join("config.toml");
        Self::load_with_env(&config_path, |key| std::env::var(key).ok())
    }

    /// Load from `path`, then apply overrides looked up through `env`.
    pub fn load_with_env(
        path: &Path,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::read_file(path)?;
        config.apply_env_overrides(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::read_file(path)?;
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Apply environment overrides.
    ///
    /// - `FASTRAG_PROVIDER` switches provider, and with it the default model
    ///   and API key variable unless those are overridden too
    /// - `FASTRAG_MODEL`, `FASTRAG_API_KEY_REF`
    /// - `FASTRAG_MAX_CONTEXT_TOKENS`, `FASTRAG_MAX_OUTPUT_TOKENS`
    /// - `DATABASE_URL`, `BACKEND_HOST`, `BACKEND_PORT`
    pub fn apply_env_overrides(
        &mut self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(provider) = env("FASTRAG_PROVIDER") {
            let provider = provider.trim().to_lowercase();
            if provider != self.provider.provider_name {
                self.provider.model_name = default_model_for(&provider).to_string();
                self.provider.api_key_ref = default_api_key_ref_for(&provider).to_string();
                self.provider.api_url = None;
            }
            self.provider.provider_name = provider;
        }

        if let Some(model) = env("FASTRAG_MODEL") {
            self.provider.model_name = model;
        }

        if let Some(key_ref) = env("FASTRAG_API_KEY_REF") {
            self.provider.api_key_ref = key_ref;
        }

        if let Some(value) = env("FASTRAG_MAX_CONTEXT_TOKENS") {
            self.provider.max_context_tokens = parse_env("FASTRAG_MAX_CONTEXT_TOKENS", &value)?;
        }

        if let Some(value) = env("FASTRAG_MAX_OUTPUT_TOKENS") {
            self.provider.max_output_tokens = parse_env("FASTRAG_MAX_OUTPUT_TOKENS", &value)?;
        }

        if let Some(url) = env("DATABASE_URL") {
            self.storage.database_url = url;
        }

        if let Some(host) = env("BACKEND_HOST") {
            self.gateway.host = host;
        }

        if let Some(value) = env("BACKEND_PORT") {
            self.gateway.port = parse_env("BACKEND_PORT", &value)?;
        }

        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".fastrag")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.provider;
        if p.temperature < 0.0 || p.temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "provider.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if p.max_output_tokens >= p.max_context_tokens {
            return Err(ConfigError::ValidationError(format!(
                "provider.max_output_tokens ({}) must be less than max_context_tokens ({})",
                p.max_output_tokens, p.max_context_tokens
            )));
        }

        if p.model_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "provider.model_name must not be empty".into(),
            ));
        }

        let r = &self.retrieval;
        if r.similarity_weight < 0.0 || r.history_baseline < 0.0 || r.recency_decay < 0.0 {
            return Err(ConfigError::ValidationError(
                "retrieval weights must be non-negative".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be at least 1".into(),
            ));
        }

        if self.embedding.dimensions == 0 {
            return Err(ConfigError::ValidationError(
                "embedding.dimensions must be > 0".into(),
            ));
        }

        match self.storage.backend.as_str() {
            "sqlite" | "memory" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "storage.backend must be \"sqlite\" or \"memory\", got \"{other}\""
                )));
            }
        }

        Ok(())
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
            system_preamble: default_system_preamble(),
            provider: ProviderConfig::default(),
            retrieval: RetrievalConfig::default(),
            retry: RetryConfig::default(),
            embedding: EmbeddingConfig::default(),
            storage: StorageConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

/// Default model when a provider is selected without naming one.
pub fn default_model_for(provider: &str) -> &'static str {
    match provider {
        "openai" => "gpt-4o-mini",
        "gemini" | "google" => "gemini-1.5-flash",
        "openrouter" => "anthropic/claude-3.5-sonnet",
        "ollama" => "llama3.1",
        _ => "claude-3-5-sonnet-20240620",
    }
}

/// Environment variable that conventionally holds the provider's key.
///
/// Empty for providers that need no key.
pub fn default_api_key_ref_for(provider: &str) -> &'static str {
    match provider {
        "openai" => "OPENAI_API_KEY",
        "gemini" | "google" => "GOOGLE_API_KEY",
        "openrouter" => "OPENROUTER_API_KEY",
        "ollama" => "",
        _ => "ANTHROPIC_API_KEY",
    }
}

/// Resolve the API key named by `api_key_ref` from the process environment.
pub fn resolve_api_key(api_key_ref: &str) -> Result<String, ConfigError> {
    resolve_api_key_with(api_key_ref, |key| std::env::var(key).ok())
}

/// Resolve the API key named by `api_key_ref` through `env`.
///
/// An empty reference means the provider needs no key.
pub fn resolve_api_key_with(
    api_key_ref: &str,
    env: impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    if api_key_ref.is_empty() {
        return Ok(String::new());
    }
    match env(api_key_ref) {
        Some(key) if !key.trim().is_empty() => Ok(key),
        _ => Err(ConfigError::MissingApiKey(api_key_ref.to_string())),
    }
}

/// Load `.env`-style variables into the process environment without
/// overriding ones already set.
///
/// With `None` the usual `.env` lookup is used and a missing file is fine.
/// Returns the file that was loaded.
pub fn load_dotenv(path: Option<&Path>) -> Result<Option<PathBuf>, ConfigError> {
    let loaded = match path {
        Some(path) => dotenvy::from_path(path).map(|()| path.to_path_buf()),
        None => dotenvy::dotenv(),
    };
    match loaded {
        Ok(path) => {
            tracing::debug!(path = %path.display(), "Loaded environment file");
            Ok(Some(path))
        }
        Err(e) if e.not_found() && path.is_none() => Ok(None),
        Err(e) => Err(ConfigError::ReadError {
            path: path.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(".env")),
            reason: e.to_string(),
        }),
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| {
        ConfigError::ValidationError(format!("{name} has an invalid value: {value:?}"))
    })
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

    #[error("API key not found: environment variable {0} is not set")]
    MissingApiKey(String),
}
