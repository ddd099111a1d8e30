//! Configuration management
//!
//! Manages orchestrator configuration: cache sizing, timeouts, storage
//! paths, and the consent bypass used by test rigs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable forcing all voice-consent capabilities to granted.
/// Intended for tests only.
pub const BYPASS_VOICE_CONSENT_ENV: &str = "BYPASS_VOICE_CONSENT_CHECK";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Orchestrator tunables
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// File storage paths
    #[serde(default)]
    pub storage: StorageConfig,
    /// Database settings
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Orchestrator tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Translation LRU cache capacity
    #[serde(default = "default_translation_cache_capacity")]
    pub translation_cache_capacity: usize,
    /// Conversation-language cache capacity
    #[serde(default = "default_language_cache_capacity")]
    pub language_cache_capacity: usize,
    /// Conversation-language cache TTL in seconds
    #[serde(default = "default_language_cache_ttl_secs")]
    pub language_cache_ttl_secs: u64,
    /// Completion dedup set capacity
    #[serde(default = "default_processed_task_capacity")]
    pub processed_task_capacity: usize,
    /// Timeout for the synchronous translate path, in seconds
    #[serde(default = "default_sync_translate_timeout_secs")]
    pub sync_translate_timeout_secs: u64,
    /// Target languages used for audio jobs when a conversation resolves to
    /// no targets and translated audio is permitted
    #[serde(default = "default_audio_fallback_languages")]
    pub audio_fallback_languages: Vec<String>,
    /// Skip the consent service and grant every capability. Tests only.
    #[serde(default)]
    pub bypass_voice_consent_check: bool,
}

fn default_translation_cache_capacity() -> usize {
    1000
}

fn default_language_cache_capacity() -> usize {
    100
}

fn default_language_cache_ttl_secs() -> u64 {
    300
}

fn default_processed_task_capacity() -> usize {
    1000
}

fn default_sync_translate_timeout_secs() -> u64 {
    10
}

fn default_audio_fallback_languages() -> Vec<String> {
    vec!["en".to_string(), "fr".to_string()]
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            translation_cache_capacity: default_translation_cache_capacity(),
            language_cache_capacity: default_language_cache_capacity(),
            language_cache_ttl_secs: default_language_cache_ttl_secs(),
            processed_task_capacity: default_processed_task_capacity(),
            sync_translate_timeout_secs: default_sync_translate_timeout_secs(),
            audio_fallback_languages: default_audio_fallback_languages(),
            bypass_voice_consent_check: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn language_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.language_cache_ttl_secs)
    }

    pub fn sync_translate_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_translate_timeout_secs)
    }

    /// Apply the `BYPASS_VOICE_CONSENT_CHECK` environment override.
    pub fn with_env_overrides(mut self) -> Self {
        if std::env::var(BYPASS_VOICE_CONSENT_ENV).as_deref() == Ok("true") {
            self.bypass_voice_consent_check = true;
        }
        self
    }
}

/// File storage paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory uploaded and generated attachment files live under
    #[serde(default = "default_uploads_root")]
    pub uploads_root: PathBuf,
}

fn default_uploads_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lingo-relay")
        .join("uploads")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            uploads_root: default_uploads_root(),
        }
    }
}

/// Database settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lingo-relay")
        .join("relay.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Config {
    /// Default config file location.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lingo-relay")
            .join("config.toml")
    }

    /// Load from the default location, falling back to defaults when the
    /// file does not exist. Environment overrides are applied either way.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load from a specific path, falling back to defaults when absent.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let mut config: Config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config from {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("parsing config at {}", path.display()))?
        } else {
            Config::default()
        };
        config.orchestrator = config.orchestrator.with_env_overrides();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.orchestrator.translation_cache_capacity, 1000);
        assert_eq!(config.orchestrator.language_cache_capacity, 100);
        assert_eq!(config.orchestrator.language_cache_ttl_secs, 300);
        assert_eq!(config.orchestrator.processed_task_capacity, 1000);
        assert_eq!(config.orchestrator.sync_translate_timeout_secs, 10);
        assert_eq!(config.orchestrator.audio_fallback_languages, vec!["en", "fr"]);
        assert!(!config.orchestrator.bypass_voice_consent_check);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [orchestrator]
            sync_translate_timeout_secs = 3
            "#,
        )
        .unwrap();
        assert_eq!(parsed.orchestrator.sync_translate_timeout_secs, 3);
        assert_eq!(parsed.orchestrator.translation_cache_capacity, 1000);
    }
}
