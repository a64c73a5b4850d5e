use std::path::{Path, PathBuf};

use chatloom_core::util::DEFAULT_SYSTEM_PROMPT;
use chatloom_core::{CompressionConfig, ModelConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const CONFIG_DIR_NAME: &str = "chatloom";
const CONFIG_FILE_NAME: &str = "config.json";
const SNAPSHOT_FILE_NAME: &str = "sessions.json";
const API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

/// Connection settings for the OpenAI-compatible endpoint.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProviderConfig {
    #[serde(default = "ProviderConfig::default_base_url")]
    pub base_url: String,
    /// Falls back to `OPENAI_API_KEY` when empty
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "ProviderConfig::default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "ProviderConfig::default_channel_capacity")]
    pub channel_capacity: usize,
    /// Delays between attempts to open a connection
    #[serde(default = "ProviderConfig::default_retry_delays_ms")]
    pub retry_delays_ms: Vec<u64>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            api_key: String::new(),
            timeout_secs: Self::default_timeout_secs(),
            channel_capacity: Self::default_channel_capacity(),
            retry_delays_ms: Self::default_retry_delays_ms(),
        }
    }
}

impl ProviderConfig {
    fn default_base_url() -> String {
        "https://api.openai.com/v1".to_string()
    }

    const fn default_timeout_secs() -> u64 {
        30
    }

    const fn default_channel_capacity() -> usize {
        16
    }

    fn default_retry_delays_ms() -> Vec<u64> {
        vec![250, 500]
    }

    /// The configured key, or the environment variable when none is set.
    #[must_use]
    pub fn resolved_api_key(&self) -> Option<String> {
        if !self.api_key.trim().is_empty() && !self.api_key.starts_with("your-") {
            return Some(self.api_key.clone());
        }
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MemoryConfig {
    #[serde(default = "MemoryConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub compression: CompressionConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            compression: CompressionConfig::default(),
        }
    }
}

impl MemoryConfig {
    const fn default_enabled() -> bool {
        true
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "ChatConfig::default_system_prompt")]
    pub system_prompt: Option<String>,
    #[serde(default = "ChatConfig::default_auto_title")]
    pub auto_title: bool,
    /// Defaults to `sessions.json` next to the config file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: Self::default_system_prompt(),
            auto_title: Self::default_auto_title(),
            snapshot_path: None,
        }
    }
}

impl ChatConfig {
    #[allow(clippy::unnecessary_wraps)]
    fn default_system_prompt() -> Option<String> {
        Some(DEFAULT_SYSTEM_PROMPT.to_string())
    }

    const fn default_auto_title() -> bool {
        true
    }
}

const CONFIG_TEMPLATE: &str = r#"{
  "provider": {
    "base_url": "https://api.openai.com/v1",
    "api_key": "your-api-key-here",
    "timeout_secs": 30,
    "channel_capacity": 16,
    "retry_delays_ms": [250, 500]
  },
  "model": {
    "model": "gpt-4o-mini",
    "temperature": 0.7,
    "max_tokens": 2000,
    "presence_penalty": 0.0,
    "top_p": 1.0
  },
  "memory": {
    "enabled": true,
    "compression": {
      "max_tail_messages": 20,
      "max_tail_tokens": 1000,
      "keep_recent_messages": 2,
      "summary_max_words": 200
    }
  },
  "chat": {
    "system_prompt": "You are a helpful AI assistant. Provide clear, concise responses.",
    "auto_title": true
  }
}"#;

impl Config {
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Cannot find home directory"))?
            .join(CONFIG_DIR_NAME))
    }

    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join(CONFIG_FILE_NAME))
    }

    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            anyhow::bail!(
                "Config file not found at: {}. Please run 'chatloom init' to create config.",
                config_path.display()
            );
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        debug!("Loading config from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config {}: {e}", path.display()))?;
        Ok(config)
    }

    pub fn ensure_config_dir() -> anyhow::Result<PathBuf> {
        let config_dir = Self::config_dir()?;
        std::fs::create_dir_all(&config_dir)?;
        Ok(config_dir)
    }

    /// Write the config template, refusing to overwrite an existing file.
    pub fn create_config() -> anyhow::Result<PathBuf> {
        let config_dir = Self::ensure_config_dir()?;
        let config_path = config_dir.join(CONFIG_FILE_NAME);
        Self::write_template(&config_path)?;
        Ok(config_path)
    }

    fn write_template(config_path: &Path) -> anyhow::Result<()> {
        if config_path.exists() {
            anyhow::bail!(
                "Config file already exists at: {}. Please edit it directly.",
                config_path.display()
            );
        }

        std::fs::write(config_path, CONFIG_TEMPLATE)?;
        info!("Created config file at {}", config_path.display());
        Ok(())
    }

    /// Where sessions are persisted.
    pub fn snapshot_path(&self) -> anyhow::Result<PathBuf> {
        match &self.chat.snapshot_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join(SNAPSHOT_FILE_NAME)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_parses_to_defaults() {
        let config: Config = serde_json::from_str(CONFIG_TEMPLATE).unwrap();
        let defaults = Config::default();

        assert_eq!(config.provider.base_url, defaults.provider.base_url);
        assert_eq!(config.provider.retry_delays_ms, vec![250, 500]);
        assert_eq!(config.model, defaults.model);
        assert_eq!(config.memory.compression, defaults.memory.compression);
        assert_eq!(config.chat.system_prompt, defaults.chat.system_prompt);
        assert!(config.chat.snapshot_path.is_none());
    }

    #[test]
    fn missing_sections_take_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"memory": {"compression": {"keep_recent_messages": 8}}}"#)
                .unwrap();

        assert!(config.memory.enabled);
        assert_eq!(config.memory.compression.keep_recent_messages, 8);
        assert_eq!(config.memory.compression.max_tail_messages, 20);
        assert_eq!(config.provider.timeout_secs, 30);
        assert!(config.chat.auto_title);
    }

    #[test]
    fn placeholder_key_is_not_used() {
        let provider = ProviderConfig {
            api_key: "sk-real".to_string(),
            ..ProviderConfig::default()
        };
        assert_eq!(provider.resolved_api_key(), Some("sk-real".to_string()));

        let provider = ProviderConfig {
            api_key: "your-api-key-here".to_string(),
            ..ProviderConfig::default()
        };
        assert_ne!(provider.resolved_api_key(), Some("your-api-key-here".to_string()));
    }

    #[test]
    fn template_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        Config::write_template(&path).unwrap();
        assert!(Config::write_template(&path).is_err());
        assert!(Config::load_from(&path).is_ok());
    }
}
