//! Inference engine trait: the abstraction over text-generation backends.
//!
//! An engine knows how to load a model file, complete a prompt either in one
//! piece or token by token, and free the model again. Engine calls are
//! synchronous and may block for seconds; callers run them off async tasks.
//!
//! Implementations: the Candle GGUF engine in `quill-engine`, scripted engines in tests.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU64;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Opaque identity of a model loaded into an engine.
///
/// Never zero: a handle exists only for a successful load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineHandle(NonZeroU64);

impl EngineHandle {
    /// Wrap a raw engine id. Returns `None` for 0.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Sampling parameters for a single completion call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
}

/// Cooperative stop request shared between a session and a running engine call.
///
/// Monotonic: once a stop is requested it stays requested. Each generation
/// gets a fresh signal.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The core engine trait.
///
/// A handle is used by at most one call at a time; the session's single-flight
/// guard enforces that, so implementations need not serialize calls themselves.
pub trait InferenceEngine: Send + Sync {
    /// A human-readable name for this engine (e.g., "candle").
    fn name(&self) -> &str;

    /// Load a model file. `thread_hint` is the number of compute threads the
    /// caller would like the engine to use.
    fn load(&self, path: &Path, thread_hint: usize) -> Result<EngineHandle, EngineError>;

    /// Complete `prompt` and return the whole generated text.
    fn complete(
        &self,
        handle: EngineHandle,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<String, EngineError>;

    /// Complete `prompt`, calling `on_token` for every piece of text as it is
    /// produced. The return value is the concatenation of all pieces.
    ///
    /// Engines that report [`supports_interrupt`](Self::supports_interrupt)
    /// must stop between tokens once `stop` is requested.
    ///
    /// Default implementation calls `complete()` and emits the result as a single piece.
    fn complete_streaming(
        &self,
        handle: EngineHandle,
        prompt: &str,
        params: &SamplingParams,
        on_token: &mut dyn FnMut(&str),
        _stop: &StopSignal,
    ) -> Result<String, EngineError> {
        let text = self.complete(handle, prompt, params)?;
        if !text.is_empty() {
            on_token(&text);
        }
        Ok(text)
    }

    /// Whether `complete_streaming` honours its [`StopSignal`].
    fn supports_interrupt(&self) -> bool {
        false
    }

    /// Release a loaded model. Unknown handles are ignored.
    ///
    /// A forced release may free a handle while a call on it is still running;
    /// that call must be allowed to finish against the model it started with.
    fn free(&self, handle: EngineHandle);
}
