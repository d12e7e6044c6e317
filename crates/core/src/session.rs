//! Session configuration and state types.

use crate::engine::SamplingParams;
use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a chat session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sampling and history parameters for a chat session.
///
/// A session never mutates its config in place: every change produces a new
/// validated value that replaces the old one, and each generation captures
/// one snapshot for its whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sampling temperature (0.0 = greedy)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Nucleus sampling threshold
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Top-k sampling cutoff
    #[serde(default = "default_top_k")]
    pub top_k: u32,

    /// Maximum tokens per reply
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// How many past turns are fed back into the prompt (0 = none)
    #[serde(default = "default_max_history_pairs")]
    pub max_history_pairs: usize,

    /// System instructions placed at the top of every prompt
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.9
}
fn default_top_k() -> u32 {
    40
}
fn default_max_tokens() -> u32 {
    512
}
fn default_max_history_pairs() -> usize {
    10
}
fn default_system_prompt() -> String {
    "You are a helpful assistant.".into()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            max_tokens: default_max_tokens(),
            max_history_pairs: default_max_history_pairs(),
            system_prompt: default_system_prompt(),
        }
    }
}

pub fn validate_temperature(temperature: f32) -> Result<(), ValidationError> {
    if temperature.is_finite() && temperature >= 0.0 {
        Ok(())
    } else {
        Err(ValidationError::new("temperature", ">= 0"))
    }
}

pub fn validate_top_p(top_p: f32) -> Result<(), ValidationError> {
    if (0.0..=1.0).contains(&top_p) {
        Ok(())
    } else {
        Err(ValidationError::new("top_p", "between 0 and 1"))
    }
}

pub fn validate_top_k(top_k: u32) -> Result<(), ValidationError> {
    if top_k >= 1 {
        Ok(())
    } else {
        Err(ValidationError::new("top_k", ">= 1"))
    }
}

pub fn validate_max_tokens(max_tokens: u32) -> Result<(), ValidationError> {
    if max_tokens >= 1 {
        Ok(())
    } else {
        Err(ValidationError::new("max_tokens", ">= 1"))
    }
}

impl SessionConfig {
    /// Check every field. The first violation wins.
    ///
    /// `max_history_pairs >= 0` holds by type.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_temperature(self.temperature)?;
        validate_top_p(self.top_p)?;
        validate_top_k(self.top_k)?;
        validate_max_tokens(self.max_tokens)?;
        Ok(())
    }

    pub fn with_temperature(mut self, temperature: f32) -> Result<Self, ValidationError> {
        validate_temperature(temperature)?;
        self.temperature = temperature;
        Ok(self)
    }

    pub fn with_top_p(mut self, top_p: f32) -> Result<Self, ValidationError> {
        validate_top_p(top_p)?;
        self.top_p = top_p;
        Ok(self)
    }

    pub fn with_top_k(mut self, top_k: u32) -> Result<Self, ValidationError> {
        validate_top_k(top_k)?;
        self.top_k = top_k;
        Ok(self)
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Result<Self, ValidationError> {
        validate_max_tokens(max_tokens)?;
        self.max_tokens = max_tokens;
        Ok(self)
    }

    pub fn with_max_history_pairs(mut self, max_pairs: usize) -> Self {
        self.max_history_pairs = max_pairs;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// The engine-facing subset of this config.
    pub fn sampling_params(&self) -> SamplingParams {
        SamplingParams {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
        }
    }
}

/// How the session asks the engine for a reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    /// Token-by-token delivery through a callback
    #[default]
    Streaming,
    /// One complete reply at the end
    Static,
}

impl GenerationMode {
    pub fn toggled(self) -> Self {
        match self {
            Self::Streaming => Self::Static,
            Self::Static => Self::Streaming,
        }
    }
}

impl std::fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streaming => f.write_str("streaming"),
            Self::Static => f.write_str("static"),
        }
    }
}

/// What a session is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Loading,
    Generating,
}
