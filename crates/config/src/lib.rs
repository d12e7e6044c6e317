//! Configuration loading, validation, and management for Quill.
//!
//! Loads configuration from `~/.quill/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use quill_core::session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.quill/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory scanned for `.gguf` model files
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Explicit model to load (otherwise the newest valid file in `models_dir`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,

    /// Stream tokens as they are generated (false = print the whole reply at once)
    #[serde(default = "default_true")]
    pub streaming: bool,

    /// Sampling and history defaults for new sessions
    #[serde(default)]
    pub session: SessionConfig,

    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_models_dir() -> PathBuf {
    AppConfig::config_dir().join("models")
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Compute threads requested from the engine (default: available parallelism)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,

    /// How long a release waits for a running generation before reclaiming the model
    #[serde(default = "default_release_grace_ms")]
    pub release_grace_ms: u64,

    /// Hugging Face repo used for `tokenizer.json` when none sits next to the model
    #[serde(default = "default_tokenizer_repo")]
    pub tokenizer_repo: String,

    /// Sampling seed
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_release_grace_ms() -> u64 {
    100
}
fn default_tokenizer_repo() -> String {
    "Qwen/Qwen2-0.5B-Instruct".into()
}
fn default_seed() -> u64 {
    42
}

/// Upper bound on `release_grace_ms`.
const MAX_RELEASE_GRACE_MS: u64 = 60_000;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: None,
            release_grace_ms: default_release_grace_ms(),
            tokenizer_repo: default_tokenizer_repo(),
            seed: default_seed(),
        }
    }
}

impl EngineConfig {
    /// The thread count to pass to `InferenceEngine::load`.
    pub fn thread_hint(&self) -> usize {
        self.threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn release_grace(&self) -> Duration {
        Duration::from_millis(self.release_grace_ms)
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.quill/config.toml).
    ///
    /// Environment variables override file values:
    /// - `QUILL_MODEL`: model file to load
    /// - `QUILL_MODELS_DIR`: directory to scan for models
    /// - `QUILL_SYSTEM_PROMPT`: system prompt
    /// - `QUILL_STREAMING`: `true`/`false`/`1`/`0`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();
        let mut config = Self::load_from(&config_path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
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

    /// Apply overrides from a variable lookup (the process environment in `load`).
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(model) = lookup("QUILL_MODEL") {
            self.model_path = Some(PathBuf::from(model));
        }

        if let Some(dir) = lookup("QUILL_MODELS_DIR") {
            self.models_dir = PathBuf::from(dir);
        }

        if let Some(prompt) = lookup("QUILL_SYSTEM_PROMPT") {
            self.session.system_prompt = prompt;
        }

        if let Some(value) = lookup("QUILL_STREAMING") {
            self.streaming = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "QUILL_STREAMING must be true or false, got '{other}'"
                    )));
                }
            };
        }

        self.validate()
    }

    /// Get the configuration directory path (`$QUILL_HOME` or `~/.quill`).
    pub fn config_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("QUILL_HOME") {
            return PathBuf::from(dir);
        }
        dirs_home().join(".quill")
    }

    /// Get the configuration file path.
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session
            .validate()
            .map_err(|e| ConfigError::ValidationError(format!("session.{e}")))?;

        if self.engine.threads == Some(0) {
            return Err(ConfigError::ValidationError(
                "engine.threads must be >= 1".into(),
            ));
        }

        if self.engine.release_grace_ms > MAX_RELEASE_GRACE_MS {
            return Err(ConfigError::ValidationError(format!(
                "engine.release_grace_ms must be <= {MAX_RELEASE_GRACE_MS}"
            )));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    /// Write this configuration to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |reason: String| ConfigError::WriteError {
            path: path.to_path_buf(),
            reason,
        };

        let content = toml::to_string_pretty(self).map_err(|e| write_err(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
        }
        std::fs::write(path, content).map_err(|e| write_err(e.to_string()))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            model_path: None,
            streaming: true,
            session: SessionConfig::default(),
            engine: EngineConfig::default(),
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

    #[error("Failed to write config file at {path}: {reason}")]
    WriteError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
