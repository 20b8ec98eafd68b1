//! TOML configuration.
//!
//! Every section is optional; a missing file or an empty one yields the
//! built-in defaults (see [`Config::default`]). [`load_config`] validates the
//! values that would otherwise fail late, at the first upload or message.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub openai: OpenAIConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub uploads: UploadConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8501".to_string()
}

/// Connection settings shared by the embeddings and chat-completion calls.
#[derive(Debug, Deserialize, Clone)]
pub struct OpenAIConfig {
    /// Base URL without trailing slash, e.g. `https://api.openai.com/v1`.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_max_retries() -> u32 {
    0
}
fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Number of retrieved chunks placed in the system prompt.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Prior user/assistant turns replayed to the model.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: default_chat_model(),
            temperature: default_temperature(),
            top_k: default_top_k(),
            history_turns: default_history_turns(),
            system_prompt: default_system_prompt(),
        }
    }
}

fn default_chat_model() -> String {
    "gpt-3.5-turbo".to_string()
}
fn default_temperature() -> f32 {
    0.1
}
fn default_top_k() -> usize {
    4
}
fn default_history_turns() -> usize {
    6
}
fn default_system_prompt() -> String {
    "You are a helpful assistant. Answer the user's questions using the excerpts \
     from their PDF document below. If the excerpts do not contain the answer, say so."
        .to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_embedding_model() -> String {
    "text-embedding-ada-002".to_string()
}
fn default_batch_size() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    /// Directory for scoped upload files. Defaults to the OS temp dir.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
            temp_dir: None,
        }
    }
}

fn default_max_bytes() -> usize {
    200 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Sessions untouched for this long are destroyed by the sweep.
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl_secs(),
        }
    }
}

fn default_idle_ttl_secs() -> u64 {
    60 * 60
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalyticsConfig {
    #[serde(default = "default_analytics_path")]
    pub path: PathBuf,
    /// Environment variable holding the analytics password.
    #[serde(default = "default_password_env")]
    pub password_env: String,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            path: default_analytics_path(),
            password_env: default_password_env(),
        }
    }
}

fn default_analytics_path() -> PathBuf {
    PathBuf::from("analytics.json")
}
fn default_password_env() -> String {
    "ANALYTICS_PASSWORD".to_string()
}

/// Load and validate a config file. A missing file falls back to defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        parse_config(&content)?
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        Config::default()
    };

    validate(&config)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse config file")
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.chat.top_k == 0 {
        anyhow::bail!("chat.top_k must be >= 1");
    }
    if !(0.0..=2.0).contains(&config.chat.temperature) {
        anyhow::bail!("chat.temperature must be in [0.0, 2.0]");
    }
    if config.uploads.max_bytes == 0 {
        anyhow::bail!("uploads.max_bytes must be > 0");
    }
    if !config.openai.api_base.starts_with("http://")
        && !config.openai.api_base.starts_with("https://")
    {
        anyhow::bail!(
            "openai.api_base must be an http(s) URL, got '{}'",
            config.openai.api_base
        );
    }
    if config.analytics.password_env.trim().is_empty() {
        anyhow::bail!("analytics.password_env must not be empty");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:8501");
        assert_eq!(cfg.chat.model, "gpt-3.5-turbo");
        assert_eq!(cfg.openai.max_retries, 0);
        assert_eq!(cfg.analytics.password_env, "ANALYTICS_PASSWORD");
        validate(&cfg).unwrap();
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let cfg = parse_config(
            r#"
            [chat]
            model = "gpt-4o-mini"

            [openai]
            api_base = "http://127.0.0.1:9999/v1"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.chat.model, "gpt-4o-mini");
        assert_eq!(cfg.chat.top_k, 4);
        assert_eq!(cfg.openai.api_base, "http://127.0.0.1:9999/v1");
        assert_eq!(cfg.openai.timeout_secs, 60);
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        let cfg = parse_config("[chunking]\nmax_tokens = 0\n").unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_rejects_non_http_api_base() {
        let cfg = parse_config("[openai]\napi_base = \"ftp://example\"\n").unwrap();
        let err = validate(&cfg).unwrap_err();
        assert!(err.to_string().contains("api_base"));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = load_config(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg.uploads.max_bytes, 200 * 1024 * 1024);
    }
}
