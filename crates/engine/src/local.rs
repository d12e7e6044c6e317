//! Local inference engine: runs GGUF models directly on your hardware.
//!
//! Uses [Candle](https://github.com/huggingface/candle) (Rust-native ML) to run
//! GGUF-quantized chat models with zero internet and zero API keys.
//!
//! The architecture is read from the GGUF metadata:
//! - **qwen2** (Qwen2 / Qwen2.5 instruct) via `quantized_qwen2`
//! - everything else (Llama, TinyLlama, SmolLM, Mistral) via `quantized_llama`
//!
//! Prompts arrive already rendered in ChatML; generation stops at the
//! tokenizer's end-of-sequence token or at an `<|im_end|>` marker.

use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::quantized_llama as qlm;
use candle_transformers::models::quantized_qwen2 as qqwen2;
use hf_hub::api::sync::Api;
use quill_core::engine::{EngineHandle, InferenceEngine, SamplingParams, StopSignal};
use quill_core::error::EngineError;
use quill_core::message::IM_END;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

/// Tokens that end a reply, whichever the tokenizer knows.
const EOS_TOKENS: [&str; 4] = ["<|im_end|>", "<|endoftext|>", "</s>", "<|eot_id|>"];

/// An engine that runs GGUF-quantized language models locally via Candle.
///
/// Each loaded model lives behind its own mutex; a running call holds an
/// `Arc` to its model, so freeing a handle mid-call only drops the map entry
/// and the weights go away when that call returns.
pub struct LocalEngine {
    models: Mutex<HashMap<u64, Arc<Mutex<LocalModelState>>>>,
    next_handle: AtomicU64,
    tokenizer_repo: String,
    seed: u64,
    device: Device,
}

/// The loaded model state (tokenizer + weights).
struct LocalModelState {
    weights: Weights,
    tokenizer: Tokenizer,
    device: Device,
    eos_token_ids: Vec<u32>,
}

enum Weights {
    Llama(qlm::ModelWeights),
    Qwen2(qqwen2::ModelWeights),
}

impl Weights {
    fn forward(&mut self, input: &Tensor, index_pos: usize) -> candle_core::Result<Tensor> {
        match self {
            Weights::Llama(m) => m.forward(input, index_pos),
            Weights::Qwen2(m) => m.forward(input, index_pos),
        }
    }
}

impl LocalEngine {
    /// Create an engine with no models loaded.
    ///
    /// `tokenizer_repo` is the Hugging Face repo used for `tokenizer.json`
    /// when none sits next to a model file.
    pub fn new(tokenizer_repo: impl Into<String>, seed: u64) -> Self {
        Self {
            models: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            tokenizer_repo: tokenizer_repo.into(),
            seed,
            device: Device::Cpu,
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<u64, Arc<Mutex<LocalModelState>>>> {
        self.models.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn model(&self, handle: EngineHandle) -> Result<Arc<Mutex<LocalModelState>>, EngineError> {
        self.registry()
            .get(&handle.get())
            .cloned()
            .ok_or(EngineError::InvalidHandle(handle.get()))
    }

    fn run(
        &self,
        handle: EngineHandle,
        prompt: &str,
        params: &SamplingParams,
        on_token: &mut dyn FnMut(&str),
        stop: &StopSignal,
    ) -> Result<String, EngineError> {
        let model = self.model(handle)?;
        let mut state = model.lock().unwrap_or_else(PoisonError::into_inner);
        state.generate(prompt, params, self.seed, on_token, stop)
    }
}

impl InferenceEngine for LocalEngine {
    fn name(&self) -> &str {
        "candle"
    }

    fn load(&self, path: &Path, thread_hint: usize) -> Result<EngineHandle, EngineError> {
        if !path.is_file() {
            return Err(EngineError::ModelNotFound(path.display().to_string()));
        }

        debug!(
            thread_hint,
            compute_threads = candle_core::utils::get_num_threads(),
            "Thread hint is advisory; Candle sizes its own pool"
        );

        let state = LocalModelState::load(path, &self.device, &self.tokenizer_repo)?;
        let raw = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let handle = EngineHandle::new(raw)
            .ok_or_else(|| EngineError::LoadFailed("engine handle space exhausted".into()))?;

        self.registry().insert(raw, Arc::new(Mutex::new(state)));
        info!(path = %path.display(), handle = %handle, "Local model loaded");
        Ok(handle)
    }

    fn complete(
        &self,
        handle: EngineHandle,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<String, EngineError> {
        self.run(handle, prompt, params, &mut |_| {}, &StopSignal::new())
    }

    fn complete_streaming(
        &self,
        handle: EngineHandle,
        prompt: &str,
        params: &SamplingParams,
        on_token: &mut dyn FnMut(&str),
        stop: &StopSignal,
    ) -> Result<String, EngineError> {
        self.run(handle, prompt, params, on_token, stop)
    }

    fn supports_interrupt(&self) -> bool {
        true
    }

    fn free(&self, handle: EngineHandle) {
        if self.registry().remove(&handle.get()).is_some() {
            info!(handle = %handle, "Local model freed");
        } else {
            warn!(handle = %handle, "Free called for an unknown handle");
        }
    }
}

impl LocalModelState {
    fn load(path: &Path, device: &Device, tokenizer_repo: &str) -> Result<Self, EngineError> {
        info!(path = %path.display(), "Loading local GGUF model");

        let mut file = std::fs::File::open(path)
            .map_err(|e| EngineError::LoadFailed(format!("Failed to open GGUF file: {e}")))?;

        let gguf = gguf_file::Content::read(&mut file)
            .map_err(|e| EngineError::LoadFailed(format!("Failed to parse GGUF file: {e}")))?;

        let architecture = gguf
            .metadata
            .get("general.architecture")
            .and_then(|v| v.to_string().ok())
            .cloned()
            .unwrap_or_else(|| "llama".to_string());
        debug!(architecture = %architecture, "GGUF architecture");

        let weights = match architecture.as_str() {
            "qwen2" => qqwen2::ModelWeights::from_gguf(gguf, &mut file, device).map(Weights::Qwen2),
            _ => qlm::ModelWeights::from_gguf(gguf, &mut file, device).map(Weights::Llama),
        }
        .map_err(|e| EngineError::LoadFailed(format!("Failed to load model weights: {e}")))?;

        let tokenizer = load_tokenizer(path, tokenizer_repo)?;

        let eos_token_ids: Vec<u32> = EOS_TOKENS
            .iter()
            .filter_map(|t| tokenizer.token_to_id(t))
            .collect();
        if eos_token_ids.is_empty() {
            warn!("Tokenizer knows no end-of-sequence token; replies run to max_tokens");
        }

        Ok(Self {
            weights,
            tokenizer,
            device: device.clone(),
            eos_token_ids,
        })
    }

    /// Run inference: tokenize, sample token by token, decode incrementally.
    ///
    /// Returns exactly the text passed to `on_token`, concatenated.
    fn generate(
        &mut self,
        prompt: &str,
        params: &SamplingParams,
        seed: u64,
        on_token: &mut dyn FnMut(&str),
        stop: &StopSignal,
    ) -> Result<String, EngineError> {
        let encoding = self
            .tokenizer
            .encode(prompt, false)
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;
        let prompt_tokens = encoding.get_ids();

        debug!(
            prompt_tokens = prompt_tokens.len(),
            max_tokens = params.max_tokens,
            temperature = params.temperature,
            "Starting local generation"
        );

        let mut logits_processor = LogitsProcessor::from_sampling(seed, sampling_for(params));
        let mut input = Tensor::new(prompt_tokens, &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(map_candle_err)?;
        let mut index_pos = 0;
        let mut generated: Vec<u32> = Vec::new();
        let mut emitted = String::new();

        for _ in 0..params.max_tokens {
            if stop.is_stop_requested() {
                debug!(tokens = generated.len(), "Stop requested, ending generation");
                break;
            }

            let logits = self
                .weights
                .forward(&input, index_pos)
                .map_err(map_candle_err)?;
            index_pos += input.dim(1).map_err(map_candle_err)?;
            let logits = last_position(logits).map_err(map_candle_err)?;

            let next_token = logits_processor.sample(&logits).map_err(map_candle_err)?;
            if self.eos_token_ids.contains(&next_token) {
                break;
            }
            generated.push(next_token);

            let text = self
                .tokenizer
                .decode(&generated, true)
                .map_err(|e| EngineError::Tokenization(format!("Detokenization failed: {e}")))?;

            // A marker spelled out as plain text ends the reply too.
            if let Some(end) = text.find(IM_END) {
                if let Some(tail) = text.get(emitted.len()..end).filter(|t| !t.is_empty()) {
                    on_token(tail);
                    emitted.push_str(tail);
                }
                break;
            }

            // Incomplete UTF-8 sequence: wait for the next token.
            if !text.ends_with('\u{FFFD}') && text.starts_with(emitted.as_str()) {
                let delta = &text[emitted.len()..];
                if !delta.is_empty() {
                    on_token(delta);
                    emitted.push_str(delta);
                }
            }

            input = Tensor::new(&[next_token][..], &self.device)
                .and_then(|t| t.unsqueeze(0))
                .map_err(map_candle_err)?;
        }

        debug!(
            completion_tokens = generated.len(),
            output_len = emitted.len(),
            "Generation complete"
        );
        Ok(emitted)
    }
}

/// `tokenizer.json` next to the model file, else from the fallback repo.
fn load_tokenizer(model_path: &Path, tokenizer_repo: &str) -> Result<Tokenizer, EngineError> {
    let local = model_path.with_file_name("tokenizer.json");
    let tokenizer_path = if local.is_file() {
        local
    } else {
        warn!(
            repo = tokenizer_repo,
            "No tokenizer.json next to the GGUF file, downloading fallback tokenizer"
        );
        let api = Api::new()
            .map_err(|e| EngineError::LoadFailed(format!("HuggingFace Hub API error: {e}")))?;
        api.model(tokenizer_repo.to_string())
            .get("tokenizer.json")
            .map_err(|e| {
                EngineError::LoadFailed(format!(
                    "Failed to download tokenizer from '{tokenizer_repo}': {e}"
                ))
            })?
    };

    Tokenizer::from_file(&tokenizer_path)
        .map_err(|e| EngineError::LoadFailed(format!("Failed to load tokenizer: {e}")))
}

/// Greedy decoding at temperature 0, otherwise top-k then top-p.
fn sampling_for(params: &SamplingParams) -> Sampling {
    if params.temperature <= 0.0 {
        Sampling::ArgMax
    } else {
        Sampling::TopKThenTopP {
            k: params.top_k as usize,
            p: params.top_p as f64,
            temperature: params.temperature as f64,
        }
    }
}

/// Logits for the last sequence position, whatever shape the model returns.
fn last_position(logits: Tensor) -> candle_core::Result<Tensor> {
    let logits = logits.squeeze(0)?;
    if logits.rank() == 2 {
        let last = logits.dim(0)? - 1;
        logits.get(last)
    } else {
        Ok(logits)
    }
}

fn map_candle_err(e: candle_core::Error) -> EngineError {
    EngineError::Inference(format!("Candle inference error: {e}"))
}
