//! Configuration management for vaultchat
//!
//! Numeric bounds come from `config.toml`; secrets only ever come from the
//! environment and are never written back.

use crate::secure_store::Vault;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding the base64 encryption key
pub const ENV_ENCRYPTION_KEY: &str = "VAULTCHAT_ENCRYPTION_KEY";
/// Environment variable holding a plaintext API credential
pub const ENV_API_KEY: &str = "ANTHROPIC_API_KEY";
/// Environment variable holding a vault-encrypted API credential
pub const ENV_ENCRYPTED_API_KEY: &str = "VAULTCHAT_ENCRYPTED_API_KEY";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub storage: StorageConfig,
    pub context: ContextConfig,
    pub retry: RetryConfig,
    pub generation: GenerationConfig,
    pub sessions: SessionsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub api_url: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            api_url: "https://api.anthropic.com/v1/messages".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one encrypted blob per session (platform data dir if unset)
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Token budget for conversational messages per request
    pub budget_tokens: usize,
    /// Absolute ceiling for the pinned system prompt
    pub system_prompt_ceiling: usize,
    /// Flat token estimate per attachment reference
    pub attachment_tokens: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget_tokens: 8000,
            system_prompt_ceiling: 4000,
            attachment_tokens: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per request, including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    /// Deadline for a single attempt
    pub request_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter: true,
            request_timeout_secs: 120,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub default_max_output_tokens: u32,
    pub max_output_tokens_ceiling: u32,
    pub default_temperature: f32,
    pub min_temperature: f32,
    pub max_temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            default_max_output_tokens: 4096,
            max_output_tokens_ceiling: 8192,
            default_temperature: 0.1,
            min_temperature: 0.0,
            max_temperature: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Upper bound on hydrated sessions before LRU eviction kicks in
    pub max_active: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self { max_active: 8 }
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    /// Load from an explicit path; a missing file yields the defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "vaultchat") {
            let config_dir = proj_dirs.config_dir();
            std::fs::create_dir_all(config_dir)?;
            Ok(config_dir.join("config.toml"))
        } else {
            Ok(PathBuf::from("config.toml"))
        }
    }

    /// Resolve the session storage directory
    pub fn storage_root(&self) -> PathBuf {
        if let Some(root) = &self.storage.root {
            return root.clone();
        }
        directories::ProjectDirs::from("", "", "vaultchat")
            .map(|dirs| dirs.data_dir().join("sessions"))
            .unwrap_or_else(|| PathBuf::from("sessions"))
    }

    /// Reject inconsistent numeric bounds
    pub fn validate(&self) -> Result<()> {
        if self.context.budget_tokens == 0 {
            bail!("context.budget_tokens must be greater than zero");
        }
        if self.context.system_prompt_ceiling == 0 {
            bail!("context.system_prompt_ceiling must be greater than zero");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            bail!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms,
                self.retry.max_delay_ms
            );
        }
        if self.retry.request_timeout_secs == 0 {
            bail!("retry.request_timeout_secs must be greater than zero");
        }
        let gen = &self.generation;
        if gen.min_temperature > gen.max_temperature {
            bail!("generation.min_temperature exceeds generation.max_temperature");
        }
        if gen.default_temperature < gen.min_temperature
            || gen.default_temperature > gen.max_temperature
        {
            bail!("generation.default_temperature is outside the configured range");
        }
        if gen.default_max_output_tokens == 0
            || gen.default_max_output_tokens > gen.max_output_tokens_ceiling
        {
            bail!("generation.default_max_output_tokens is outside 1..=max_output_tokens_ceiling");
        }
        if self.sessions.max_active == 0 {
            bail!("sessions.max_active must be at least 1");
        }
        Ok(())
    }
}

/// Secret material supplied out-of-band
pub struct Secrets {
    pub encryption_key: String,
    pub api_key: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("encryption_key", &"<redacted>")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Secrets {
    /// Read the key and credential from the environment
    ///
    /// The credential may be given in plaintext or vault-encrypted with the key.
    pub fn from_env() -> Result<Self> {
        let encryption_key = std::env::var(ENV_ENCRYPTION_KEY)
            .with_context(|| format!("{} environment variable not set", ENV_ENCRYPTION_KEY))?;

        let api_key = match std::env::var(ENV_API_KEY) {
            Ok(key) if !key.trim().is_empty() => Some(key),
            _ => match std::env::var(ENV_ENCRYPTED_API_KEY) {
                Ok(encrypted) => {
                    let vault = Vault::from_base64(&encryption_key)?;
                    Some(
                        vault
                            .decrypt_credential(&encrypted)
                            .context("Failed to decrypt API credential")?,
                    )
                }
                Err(_) => None,
            },
        };

        Ok(Self {
            encryption_key,
            api_key,
        })
    }
}
