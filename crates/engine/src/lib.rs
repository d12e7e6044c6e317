//! Inference engines and model discovery for Quill.
//!
//! - [`scan`] finds GGUF model files on disk.
//! - [`local`] runs them with Candle (behind the `local` feature).
//! - [`build_from_config`] picks the engine the binary was built with.

#[cfg(feature = "local")]
pub mod local;
pub mod scan;

pub use scan::{ModelScanner, format_size};

use quill_config::AppConfig;
use quill_core::engine::InferenceEngine;
use quill_core::error::EngineError;
use std::sync::Arc;

/// Build the inference engine described by the config.
///
/// Without the `local` feature there is no engine to build and this returns
/// [`EngineError::Unavailable`].
pub fn build_from_config(config: &AppConfig) -> Result<Arc<dyn InferenceEngine>, EngineError> {
    #[cfg(feature = "local")]
    {
        let engine =
            local::LocalEngine::new(config.engine.tokenizer_repo.clone(), config.engine.seed);
        tracing::debug!(engine = engine.name(), "Inference engine ready");
        Ok(Arc::new(engine))
    }

    #[cfg(not(feature = "local"))]
    {
        let _ = config;
        Err(EngineError::Unavailable(
            "quill was built without local inference; rebuild with `--features local`".into(),
        ))
    }
}
