//! Error types for the Quill domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error type.

use thiserror::Error;

// --- Bounded context errors ---

/// Errors returned by a chat session's generation and lifecycle operations.
///
/// `ModelNotLoaded` and `AlreadyGenerating` are precondition failures: they are
/// detected before the engine is touched and leave no partial state behind.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GenerationError {
    #[error("No model loaded, load a model first")]
    ModelNotLoaded,

    #[error("A generation is already in progress for this session")]
    AlreadyGenerating,

    #[error("Invalid value for {field}: must be {constraint}")]
    Validation { field: &'static str, constraint: String },

    #[error("Engine failure: {message}")]
    EngineFailure { message: String },
}

impl GenerationError {
    /// Whether this error was raised before any engine call was made.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::ModelNotLoaded | Self::AlreadyGenerating)
    }
}

/// A rejected configuration value.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{field} must be {constraint}")]
pub struct ValidationError {
    /// The offending field name (e.g. `"top_p"`).
    pub field: &'static str,
    /// The violated constraint, human readable (e.g. `"between 0 and 1"`).
    pub constraint: String,
}

impl ValidationError {
    pub fn new(field: &'static str, constraint: impl Into<String>) -> Self {
        Self {
            field,
            constraint: constraint.into(),
        }
    }
}

impl From<ValidationError> for GenerationError {
    fn from(e: ValidationError) -> Self {
        Self::Validation {
            field: e.field,
            constraint: e.constraint,
        }
    }
}

/// Failures surfaced by an inference engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("Model file not found: {0}")]
    ModelNotFound(String),

    #[error("Model loading failed: {0}")]
    LoadFailed(String),

    #[error("Unknown engine handle: {0}")]
    InvalidHandle(u64),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Engine unavailable: {0}")]
    Unavailable(String),
}

impl From<EngineError> for GenerationError {
    fn from(e: EngineError) -> Self {
        Self::EngineFailure {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_names_field_and_constraint() {
        let err = GenerationError::from(ValidationError::new("top_p", "between 0 and 1"));
        assert!(err.to_string().contains("top_p"));
        assert!(err.to_string().contains("between 0 and 1"));
    }

    #[test]
    fn engine_error_wraps_as_engine_failure() {
        let err: GenerationError = EngineError::Inference("decode failed".into()).into();
        match &err {
            GenerationError::EngineFailure { message } => {
                assert!(message.contains("decode failed"));
            }
            other => panic!("Expected EngineFailure, got {other:?}"),
        }
        assert!(!err.is_precondition());
    }

    #[test]
    fn precondition_errors_are_flagged() {
        assert!(GenerationError::ModelNotLoaded.is_precondition());
        assert!(GenerationError::AlreadyGenerating.is_precondition());
    }
}
