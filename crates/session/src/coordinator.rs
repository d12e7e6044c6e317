//! The generation coordinator: one chat session bound to one model.
//!
//! A [`ChatSession`] owns the model binding, the rolling history, and the
//! current [`SessionConfig`] snapshot, and admits at most one generation (or
//! model load) at a time.
//!
//! # Concurrency
//!
//! - Config is copy-on-write (`RwLock<Arc<SessionConfig>>`); a generation
//!   captures one snapshot for its whole run.
//! - Admission is a check-and-set on one mutex. The resulting guard moves into
//!   the blocking engine task, so the session stays busy until the engine
//!   call actually returns, even if the caller stops waiting.
//! - Tokens travel from the engine thread over a bounded channel and are
//!   delivered on the caller's task, in engine order.
//! - Lock order: state, then binding; config, then history.

use crate::context::ContextBuilder;
use crate::stream_event::GenerationEvent;
use chrono::Utc;
use quill_config::AppConfig;
use quill_core::engine::{EngineHandle, InferenceEngine, StopSignal};
use quill_core::error::{EngineError, GenerationError, ValidationError};
use quill_core::event::{DomainEvent, EventBus};
use quill_core::message::{History, Turn};
use quill_core::model::ModelInfo;
use quill_core::session::{GenerationMode, SessionConfig, SessionId, SessionState};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, broadcast, mpsc};
use tracing::{debug, info, warn};

/// Capacity of the engine-thread to caller token channel.
const TOKEN_CHANNEL_CAPACITY: usize = 64;

/// Default wait for a running generation before a release reclaims the model.
const DEFAULT_RELEASE_GRACE: Duration = Duration::from_millis(100);

/// What the session is doing. A load's `discard` flag is raised by a release
/// that arrives before the load binds its model; a generation's `stop` flag by
/// cancellation.
enum Slot {
    Idle,
    Loading { discard: StopSignal },
    Generating { stop: StopSignal },
}

impl Slot {
    fn as_state(&self) -> SessionState {
        match self {
            Slot::Idle => SessionState::Idle,
            Slot::Loading { .. } => SessionState::Loading,
            Slot::Generating { .. } => SessionState::Generating,
        }
    }
}

struct ModelBinding {
    handle: EngineHandle,
    info: ModelInfo,
}

struct SessionInner {
    id: SessionId,
    engine: Arc<dyn InferenceEngine>,
    config: RwLock<Arc<SessionConfig>>,
    history: Mutex<History>,
    state: Mutex<Slot>,
    binding: Mutex<Option<ModelBinding>>,
    mode: Mutex<GenerationMode>,
    idle: Notify,
    events: Arc<EventBus>,
    thread_hint: usize,
    release_grace: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exclusive right to use the session's model. Dropping it returns the
/// session to `Idle` and wakes anyone waiting for that.
struct SessionGuard {
    inner: Arc<SessionInner>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        *lock(&self.inner.state) = Slot::Idle;
        self.inner.idle.notify_waiters();
    }
}

/// An admitted generation: the guard, the model it runs on, and its stop signal.
struct Admission {
    guard: SessionGuard,
    handle: EngineHandle,
    stop: StopSignal,
}

impl SessionInner {
    fn config(&self) -> Arc<SessionConfig> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, event: DomainEvent) {
        self.events.publish(event);
    }

    fn bound_handle(&self) -> Option<EngineHandle> {
        lock(&self.binding).as_ref().map(|b| b.handle)
    }

    fn take_binding(&self) -> Option<ModelBinding> {
        lock(&self.binding).take()
    }

    fn clear_history(&self) -> usize {
        let mut history = lock(&self.history);
        let removed = history.len();
        history.clear();
        removed
    }

    /// Replace the config with `update(current)`, trimming history to the new
    /// bound before any reader can see it.
    fn update_config(
        &self,
        update: impl FnOnce(SessionConfig) -> Result<SessionConfig, ValidationError>,
    ) -> Result<(), GenerationError> {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        let next = update(SessionConfig::clone(&config))?;
        next.validate()?;

        let trimmed = ContextBuilder::trim(&mut lock(&self.history), next.max_history_pairs);
        *config = Arc::new(next);
        drop(config);

        debug!(session_id = %self.id, trimmed, "Config replaced");
        self.publish(DomainEvent::ConfigChanged {
            session_id: self.id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Append a finished turn and trim with the bound in force right now.
    fn append_turn(&self, turn: Turn) {
        let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
        let mut history = lock(&self.history);
        history.push(turn);
        ContextBuilder::trim(&mut history, config.max_history_pairs);
    }

    /// Mark a running load so it frees its handle instead of binding it.
    fn discard_pending_load(&self) {
        if let Slot::Loading { discard } = &*lock(&self.state) {
            debug!(session_id = %self.id, "Release requested while loading");
            discard.request_stop();
        }
    }

    /// Wait until no generation or load holds the session, up to `grace`.
    /// Returns false if the grace period ran out first.
    async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.idle.notified();
            let mut notified = std::pin::pin!(notified);
            notified.as_mut().enable();

            if matches!(*lock(&self.state), Slot::Idle) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return matches!(*lock(&self.state), Slot::Idle);
            }
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let binding = self
            .binding
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(binding) = binding {
            debug!(session_id = %self.id, handle = %binding.handle, "Freeing model on session teardown");
            self.engine.free(binding.handle);
        }
    }
}

/// Admit a load: the session must be idle.
fn begin_load(inner: &Arc<SessionInner>) -> Result<SessionGuard, GenerationError> {
    let mut state = lock(&inner.state);
    if !matches!(*state, Slot::Idle) {
        return Err(GenerationError::AlreadyGenerating);
    }
    *state = Slot::Loading {
        discard: StopSignal::new(),
    };
    Ok(SessionGuard {
        inner: Arc::clone(inner),
    })
}

/// Bind a handle returned by `InferenceEngine::load`, or free it when a
/// release arrived while the load was running.
fn finish_load(
    guard: SessionGuard,
    path: &Path,
    loaded: Result<EngineHandle, EngineError>,
    started: Instant,
) -> Result<ModelInfo, GenerationError> {
    let inner = Arc::clone(&guard.inner);
    let handle = match loaded {
        Ok(handle) => handle,
        Err(e) => {
            warn!(session_id = %inner.id, error = %e, "Model load failed");
            return Err(e.into());
        }
    };

    let state = lock(&inner.state);
    let discarded = matches!(&*state, Slot::Loading { discard } if discard.is_stop_requested());
    if discarded {
        drop(state);
        inner.engine.free(handle);
        drop(guard);
        info!(session_id = %inner.id, handle = %handle, "Session released while loading, model freed");
        return Err(GenerationError::EngineFailure {
            message: "Session was released while the model was loading".into(),
        });
    }
    let info = ModelInfo::new(path);
    *lock(&inner.binding) = Some(ModelBinding {
        handle,
        info: info.clone(),
    });
    drop(state);

    let cleared = inner.clear_history();
    drop(guard);

    let duration_ms = started.elapsed().as_millis() as u64;
    info!(
        session_id = %inner.id,
        handle = %handle,
        duration_ms,
        history_cleared = cleared,
        "Model loaded"
    );
    inner.publish(DomainEvent::ModelLoaded {
        session_id: inner.id.to_string(),
        path: path.to_path_buf(),
        duration_ms,
        timestamp: Utc::now(),
    });
    Ok(info)
}

/// Admit a generation: the session must be idle and have a model.
fn begin_generation(inner: &Arc<SessionInner>) -> Result<Admission, GenerationError> {
    let mut state = lock(&inner.state);
    if !matches!(*state, Slot::Idle) {
        return Err(GenerationError::AlreadyGenerating);
    }
    let handle = inner
        .bound_handle()
        .ok_or(GenerationError::ModelNotLoaded)?;

    let stop = StopSignal::new();
    *state = Slot::Generating { stop: stop.clone() };
    Ok(Admission {
        guard: SessionGuard {
            inner: Arc::clone(inner),
        },
        handle,
        stop,
    })
}

/// Builder for a [`ChatSession`].
pub struct SessionBuilder {
    engine: Arc<dyn InferenceEngine>,
    config: SessionConfig,
    mode: GenerationMode,
    events: Arc<EventBus>,
    thread_hint: usize,
    release_grace: Duration,
}

impl SessionBuilder {
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Self {
        Self {
            engine,
            config: SessionConfig::default(),
            mode: GenerationMode::default(),
            events: Arc::new(EventBus::default()),
            thread_hint: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            release_grace: DEFAULT_RELEASE_GRACE,
        }
    }

    /// Start from the application config: session defaults, streaming mode,
    /// engine thread hint and release grace period.
    pub fn from_app_config(engine: Arc<dyn InferenceEngine>, app: &AppConfig) -> Self {
        let mode = if app.streaming {
            GenerationMode::Streaming
        } else {
            GenerationMode::Static
        };
        Self::new(engine)
            .with_config(app.session.clone())
            .with_mode(mode)
            .with_thread_hint(app.engine.thread_hint())
            .with_release_grace(app.engine.release_grace())
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_mode(mut self, mode: GenerationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_thread_hint(mut self, threads: usize) -> Self {
        self.thread_hint = threads.max(1);
        self
    }

    pub fn with_release_grace(mut self, grace: Duration) -> Self {
        self.release_grace = grace;
        self
    }

    /// Validate the config and create the session.
    pub fn build(self) -> Result<ChatSession, GenerationError> {
        self.config.validate()?;
        Ok(self.assemble())
    }

    fn assemble(self) -> ChatSession {
        let id = SessionId::new();
        info!(session_id = %id, engine = self.engine.name(), mode = %self.mode, "Chat session created");

        ChatSession {
            inner: Arc::new(SessionInner {
                id,
                engine: self.engine,
                config: RwLock::new(Arc::new(self.config)),
                history: Mutex::new(History::new()),
                state: Mutex::new(Slot::Idle),
                binding: Mutex::new(None),
                mode: Mutex::new(self.mode),
                idle: Notify::new(),
                events: self.events,
                thread_hint: self.thread_hint,
                release_grace: self.release_grace,
            }),
        }
    }
}

/// One chat session: a model binding, a rolling history, and a config.
///
/// Cheap to clone; clones share the same session. The model is freed when the
/// last clone (and the last running generation) is gone.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<SessionInner>,
}

impl ChatSession {
    /// A session with default config and streaming mode.
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Self {
        SessionBuilder::new(engine).assemble()
    }

    pub fn builder(engine: Arc<dyn InferenceEngine>) -> SessionBuilder {
        SessionBuilder::new(engine)
    }

    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    /// Subscribe to this session's domain events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.inner.events.subscribe()
    }

    // ── Model lifecycle ───────────────────────────────────────────────

    /// Load a model file and bind it to this session.
    ///
    /// Rejected with `AlreadyGenerating` while a generation or another load
    /// is running. Any previous model is freed first; history is cleared on
    /// success.
    pub async fn load_model(&self, path: impl AsRef<Path>) -> Result<ModelInfo, GenerationError> {
        let path = path.as_ref().to_path_buf();
        let guard = begin_load(&self.inner)?;

        if !path.is_file() {
            return Err(GenerationError::EngineFailure {
                message: format!("Model file not found: {}", path.display()),
            });
        }

        if let Some(old) = self.inner.take_binding() {
            info!(session_id = %self.inner.id, handle = %old.handle, "Freeing previous model");
            self.inner.engine.free(old.handle);
        }

        info!(
            session_id = %self.inner.id,
            path = %path.display(),
            threads = self.inner.thread_hint,
            "Loading model"
        );
        let started = Instant::now();
        let thread_hint = self.inner.thread_hint;
        // The guard travels with the engine call: the session stays `Loading`
        // until the engine returns, and the handle is bound or freed there even
        // if the caller stops waiting.
        tokio::task::spawn_blocking(move || {
            let inner = Arc::clone(&guard.inner);
            let loaded = inner.engine.load(&path, thread_hint);
            finish_load(guard, &path, loaded, started)
        })
        .await
        .map_err(|e| GenerationError::EngineFailure {
            message: format!("Model loading task failed: {e}"),
        })?
    }

    /// Unbind and free the model.
    ///
    /// Requests cancellation, waits up to the grace period for a running
    /// generation to finish, then frees the handle regardless and clears the
    /// history. A load still running at that point frees its model instead of
    /// binding it. Calling it with no model bound does nothing.
    pub async fn release(&self) {
        self.cancel();
        self.inner.discard_pending_load();
        let finished = self.inner.wait_idle(self.inner.release_grace).await;

        let Some(binding) = self.inner.take_binding() else {
            return;
        };
        if !finished {
            warn!(
                session_id = %self.inner.id,
                grace_ms = self.inner.release_grace.as_millis() as u64,
                "Generation still running after grace period, reclaiming model"
            );
        }

        self.inner.engine.free(binding.handle);
        let cleared = self.inner.clear_history();
        info!(
            session_id = %self.inner.id,
            handle = %binding.handle,
            forced = !finished,
            history_cleared = cleared,
            "Model released"
        );
        self.inner.publish(DomainEvent::ModelReleased {
            session_id: self.inner.id.to_string(),
            forced: !finished,
            timestamp: Utc::now(),
        });
    }

    pub fn is_model_loaded(&self) -> bool {
        self.inner.bound_handle().is_some()
    }

    pub fn model_info(&self) -> Option<ModelInfo> {
        lock(&self.inner.binding).as_ref().map(|b| b.info.clone())
    }

    // ── Generation ────────────────────────────────────────────────────

    /// Generate a reply without observing tokens.
    pub async fn generate(&self, input: &str) -> Result<String, GenerationError> {
        self.generate_with(input, |_| {}).await
    }

    /// Generate a reply to `input`, calling `on_token` for each piece of text
    /// in streaming mode.
    ///
    /// Fails with `ModelNotLoaded` or `AlreadyGenerating` before touching the
    /// engine. On success the cleaned reply is appended to history and
    /// returned; on failure history is untouched. Either way the session is
    /// idle again when this returns.
    pub async fn generate_with<F>(&self, input: &str, on_token: F) -> Result<String, GenerationError>
    where
        F: FnMut(&str) + Send,
    {
        let admission = begin_generation(&self.inner)?;
        self.run_generation(admission, input, on_token).await
    }

    /// Start a generation on a background task and stream its events.
    ///
    /// Preconditions are checked before this returns. The receiver yields
    /// `Token` events followed by exactly one `Done` or `Error`.
    pub fn generate_stream(
        &self,
        input: impl Into<String>,
    ) -> Result<mpsc::UnboundedReceiver<GenerationEvent>, GenerationError> {
        let admission = begin_generation(&self.inner)?;
        let input = input.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let session = self.clone();

        tokio::spawn(async move {
            let mut tokens = 0usize;
            let token_tx = tx.clone();
            let result = session
                .run_generation(admission, &input, |token| {
                    tokens += 1;
                    let _ = token_tx.send(GenerationEvent::Token {
                        content: token.to_string(),
                    });
                })
                .await;

            let terminal = match result {
                Ok(text) => GenerationEvent::Done { text, tokens },
                Err(e) => GenerationEvent::Error {
                    message: e.to_string(),
                },
            };
            let _ = tx.send(terminal);
        });

        Ok(rx)
    }

    /// Request cancellation of the running generation.
    ///
    /// Idempotent and non-blocking; does nothing when idle. Once the consumer
    /// observes the request, no further token reaches the caller; a token
    /// already being handed over when this is called may still arrive.
    pub fn cancel(&self) {
        if let Slot::Generating { stop } = &*lock(&self.inner.state) {
            if !stop.is_stop_requested() {
                debug!(session_id = %self.inner.id, "Cancellation requested");
            }
            stop.request_stop();
        }
    }

    pub fn is_generating(&self) -> bool {
        matches!(*lock(&self.inner.state), Slot::Generating { .. })
    }

    pub fn state(&self) -> SessionState {
        lock(&self.inner.state).as_state()
    }

    async fn run_generation<F>(
        &self,
        admission: Admission,
        input: &str,
        mut on_token: F,
    ) -> Result<String, GenerationError>
    where
        F: FnMut(&str) + Send,
    {
        let Admission {
            guard,
            handle,
            stop,
        } = admission;
        let inner = &self.inner;

        let config = inner.config();
        let prompt = {
            let history = lock(&inner.history);
            ContextBuilder::build(&config.system_prompt, &history, input)
        };
        let params = config.sampling_params();
        let mode = self.mode();

        info!(
            session_id = %inner.id,
            mode = %mode,
            prompt_chars = prompt.len(),
            max_tokens = params.max_tokens,
            "Generation started"
        );
        inner.publish(DomainEvent::GenerationStarted {
            session_id: inner.id.to_string(),
            mode,
            prompt_chars: prompt.len(),
            timestamp: Utc::now(),
        });

        let started = Instant::now();
        let engine = Arc::clone(&inner.engine);
        let mut delivered = 0usize;

        let joined = match mode {
            GenerationMode::Streaming => {
                let (tx, mut rx) = mpsc::channel::<String>(TOKEN_CHANNEL_CAPACITY);
                let task_stop = stop.clone();
                let task = tokio::task::spawn_blocking(move || {
                    let engine_stop = if engine.supports_interrupt() {
                        task_stop.clone()
                    } else {
                        StopSignal::new()
                    };
                    let mut forward = |token: &str| {
                        if !task_stop.is_stop_requested() {
                            // The receiver is gone only if the caller stopped waiting.
                            let _ = tx.blocking_send(token.to_string());
                        }
                    };
                    let result =
                        engine.complete_streaming(handle, &prompt, &params, &mut forward, &engine_stop);
                    (result, guard)
                });

                while let Some(token) = rx.recv().await {
                    if !stop.is_stop_requested() {
                        on_token(&token);
                        delivered += 1;
                    }
                }
                task.await
            }
            GenerationMode::Static => {
                tokio::task::spawn_blocking(move || {
                    (engine.complete(handle, &prompt, &params), guard)
                })
                .await
            }
        };

        let (result, guard) = match joined {
            Ok(output) => output,
            Err(e) => {
                // The guard was dropped with the panicking task.
                let message = format!("Inference task failed: {e}");
                warn!(session_id = %inner.id, error = %message, "Generation failed");
                inner.publish(DomainEvent::GenerationFailed {
                    session_id: inner.id.to_string(),
                    error_message: message.clone(),
                    timestamp: Utc::now(),
                });
                return Err(GenerationError::EngineFailure { message });
            }
        };

        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                drop(guard);
                warn!(session_id = %inner.id, error = %e, "Generation failed");
                inner.publish(DomainEvent::GenerationFailed {
                    session_id: inner.id.to_string(),
                    error_message: e.to_string(),
                    timestamp: Utc::now(),
                });
                return Err(e.into());
            }
        };

        let text = ContextBuilder::clean(&raw);
        // A forced release may have unbound the model mid-run.
        if inner.bound_handle() == Some(handle) {
            inner.append_turn(Turn::new(input, text.clone()));
        } else {
            debug!(session_id = %inner.id, "Model released during generation, turn not recorded");
        }
        drop(guard);

        let duration_ms = started.elapsed().as_millis() as u64;
        if stop.is_stop_requested() {
            info!(session_id = %inner.id, tokens = delivered, duration_ms, "Generation cancelled");
            inner.publish(DomainEvent::GenerationCancelled {
                session_id: inner.id.to_string(),
                tokens_delivered: delivered,
                timestamp: Utc::now(),
            });
        } else {
            info!(
                session_id = %inner.id,
                tokens = delivered,
                response_chars = text.len(),
                duration_ms,
                "Generation completed"
            );
            inner.publish(DomainEvent::GenerationCompleted {
                session_id: inner.id.to_string(),
                tokens_delivered: delivered,
                response_chars: text.len(),
                duration_ms,
                timestamp: Utc::now(),
            });
        }
        Ok(text)
    }

    // ── Mode ──────────────────────────────────────────────────────────

    pub fn mode(&self) -> GenerationMode {
        *lock(&self.inner.mode)
    }

    /// Takes effect from the next generation.
    pub fn set_mode(&self, mode: GenerationMode) {
        *lock(&self.inner.mode) = mode;
    }

    /// Flip between streaming and static; returns the new mode.
    pub fn toggle_mode(&self) -> GenerationMode {
        let mut mode = lock(&self.inner.mode);
        *mode = mode.toggled();
        *mode
    }

    // ── Config ────────────────────────────────────────────────────────

    /// The current config snapshot.
    pub fn config(&self) -> Arc<SessionConfig> {
        self.inner.config()
    }

    /// Replace the whole config. Invalid values are rejected and the stored
    /// config is left unchanged.
    pub fn set_config(&self, config: SessionConfig) -> Result<(), GenerationError> {
        self.inner.update_config(|_| Ok(config))
    }

    pub fn set_temperature(&self, temperature: f32) -> Result<(), GenerationError> {
        self.inner.update_config(|c| c.with_temperature(temperature))
    }

    pub fn set_top_p(&self, top_p: f32) -> Result<(), GenerationError> {
        self.inner.update_config(|c| c.with_top_p(top_p))
    }

    pub fn set_top_k(&self, top_k: u32) -> Result<(), GenerationError> {
        self.inner.update_config(|c| c.with_top_k(top_k))
    }

    pub fn set_max_tokens(&self, max_tokens: u32) -> Result<(), GenerationError> {
        self.inner.update_config(|c| c.with_max_tokens(max_tokens))
    }

    /// Also trims the current history to the new bound.
    pub fn set_max_history_pairs(&self, max_pairs: usize) -> Result<(), GenerationError> {
        self.inner
            .update_config(|c| Ok(c.with_max_history_pairs(max_pairs)))
    }

    pub fn set_system_prompt(&self, prompt: impl Into<String>) -> Result<(), GenerationError> {
        let prompt = prompt.into();
        self.inner
            .update_config(|c| Ok(c.with_system_prompt(prompt)))
    }

    // ── History ───────────────────────────────────────────────────────

    pub fn clear_history(&self) {
        let removed = self.inner.clear_history();
        debug!(session_id = %self.inner.id, removed, "History cleared");
        self.inner.publish(DomainEvent::HistoryCleared {
            session_id: self.inner.id.to_string(),
            turns_removed: removed,
            timestamp: Utc::now(),
        });
    }

    pub fn history_len(&self) -> usize {
        lock(&self.inner.history).len()
    }

    /// Copy of the retained turns, oldest first.
    pub fn history(&self) -> Vec<Turn> {
        lock(&self.inner.history).turns()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::engine::SamplingParams;
    use quill_core::error::EngineError;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    /// Engine that replays a fixed token script and records every call.
    #[derive(Default)]
    struct ScriptedEngine {
        tokens: Vec<&'static str>,
        fail_with: Option<EngineError>,
        next_handle: AtomicU64,
        calls: AtomicUsize,
        freed: Mutex<Vec<EngineHandle>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedEngine {
        fn new(tokens: &[&'static str]) -> Arc<Self> {
            Arc::new(Self {
                tokens: tokens.to_vec(),
                ..Self::default()
            })
        }

        fn failing(error: EngineError) -> Arc<Self> {
            Arc::new(Self {
                fail_with: Some(error),
                ..Self::default()
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn freed(&self) -> Vec<EngineHandle> {
            self.freed.lock().unwrap().clone()
        }

        fn last_prompt(&self) -> String {
            self.prompts.lock().unwrap().last().cloned().unwrap_or_default()
        }

        fn record(&self, prompt: &str) -> Result<(), EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(prompt.to_string());
            match &self.fail_with {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }
    }

    impl InferenceEngine for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }

        fn load(&self, _path: &Path, _thread_hint: usize) -> Result<EngineHandle, EngineError> {
            let raw = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(EngineHandle::new(raw).unwrap())
        }

        fn complete(
            &self,
            _handle: EngineHandle,
            prompt: &str,
            _params: &SamplingParams,
        ) -> Result<String, EngineError> {
            self.record(prompt)?;
            Ok(self.tokens.concat())
        }

        fn complete_streaming(
            &self,
            _handle: EngineHandle,
            prompt: &str,
            _params: &SamplingParams,
            on_token: &mut dyn FnMut(&str),
            _stop: &StopSignal,
        ) -> Result<String, EngineError> {
            self.record(prompt)?;
            for token in &self.tokens {
                on_token(token);
            }
            Ok(self.tokens.concat())
        }

        fn free(&self, handle: EngineHandle) {
            self.freed.lock().unwrap().push(handle);
        }
    }

    fn model_file() -> tempfile::NamedTempFile {
        tempfile::Builder::new().suffix(".gguf").tempfile().unwrap()
    }

    async fn loaded_session(engine: Arc<ScriptedEngine>) -> (ChatSession, tempfile::NamedTempFile) {
        let file = model_file();
        let session = ChatSession::new(engine);
        session.load_model(file.path()).await.unwrap();
        (session, file)
    }

    #[tokio::test]
    async fn generate_without_model_is_rejected() {
        let engine = ScriptedEngine::new(&["hi"]);
        let session = ChatSession::new(engine.clone());

        let err = session.generate("Hello").await.unwrap_err();
        assert_eq!(err, GenerationError::ModelNotLoaded);
        assert_eq!(engine.calls(), 0);
        assert_eq!(session.history_len(), 0);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn streaming_generation_relays_tokens_and_records_turn() {
        let engine = ScriptedEngine::new(&["Hel", "lo", "!", "<|im_end|>"]);
        let (session, _file) = loaded_session(engine.clone()).await;

        let mut received = Vec::new();
        let reply = session
            .generate_with("Hi", |t| received.push(t.to_string()))
            .await
            .unwrap();

        assert_eq!(received, vec!["Hel", "lo", "!", "<|im_end|>"]);
        assert_eq!(reply, "Hello!");
        assert_eq!(session.history(), vec![Turn::new("Hi", "Hello!")]);
        assert!(!session.is_generating());
        assert_eq!(
            engine.last_prompt(),
            "<|im_start|>system\nYou are a helpful assistant.<|im_end|>\n\
             <|im_start|>user\nHi<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[tokio::test]
    async fn static_mode_delivers_no_tokens() {
        let engine = ScriptedEngine::new(&["Whole ", "reply"]);
        let (session, _file) = loaded_session(engine.clone()).await;
        session.set_mode(GenerationMode::Static);

        let mut count = 0;
        let reply = session.generate_with("q", |_| count += 1).await.unwrap();
        assert_eq!(reply, "Whole reply");
        assert_eq!(count, 0);
        assert_eq!(session.history_len(), 1);
    }

    #[tokio::test]
    async fn history_feeds_next_prompt_and_is_trimmed() {
        let engine = ScriptedEngine::new(&["ok"]);
        let (session, _file) = loaded_session(engine.clone()).await;
        session.set_max_history_pairs(1).unwrap();

        session.generate("first").await.unwrap();
        session.generate("second").await.unwrap();
        assert!(engine.last_prompt().contains("user\nfirst<|im_end|>"));

        session.generate("third").await.unwrap();
        assert_eq!(session.history(), vec![Turn::new("third", "ok")]);
        assert!(!engine.last_prompt().contains("first"));
    }

    #[tokio::test]
    async fn shrinking_history_bound_trims_immediately() {
        let engine = ScriptedEngine::new(&["ok"]);
        let (session, _file) = loaded_session(engine).await;
        for q in ["a", "b", "c"] {
            session.generate(q).await.unwrap();
        }

        session.set_max_history_pairs(2).unwrap();
        let users: Vec<String> = session.history().into_iter().map(|t| t.user).collect();
        assert_eq!(users, vec!["b", "c"]);

        session.set_max_history_pairs(0).unwrap();
        assert_eq!(session.history_len(), 0);
        session.generate("d").await.unwrap();
        assert_eq!(session.history_len(), 0);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_unchanged() {
        let session = ChatSession::new(ScriptedEngine::new(&[]));
        let before = session.config();

        let bad = SessionConfig {
            top_p: 1.5,
            ..SessionConfig::default()
        };
        let err = session.set_config(bad).unwrap_err();
        assert!(matches!(err, GenerationError::Validation { field: "top_p", .. }));
        assert_eq!(*session.config(), *before);

        assert!(session.set_temperature(-0.1).is_err());
        assert!(session.set_top_k(0).is_err());
        assert!(session.set_max_tokens(0).is_err());
        assert_eq!(*session.config(), *before);

        session.set_temperature(0.0).unwrap();
        assert_eq!(session.config().temperature, 0.0);
    }

    #[tokio::test]
    async fn config_snapshots_are_independent() {
        let session = ChatSession::new(ScriptedEngine::new(&[]));
        let snapshot = session.config();
        session.set_system_prompt("Answer in French.").unwrap();

        assert_eq!(snapshot.system_prompt, "You are a helpful assistant.");
        assert_eq!(session.config().system_prompt, "Answer in French.");
    }

    #[tokio::test]
    async fn engine_failure_leaves_history_and_frees_guard() {
        let engine = ScriptedEngine::failing(EngineError::Inference("kv cache full".into()));
        let (session, _file) = loaded_session(engine.clone()).await;

        let err = session.generate("Hi").await.unwrap_err();
        match err {
            GenerationError::EngineFailure { message } => assert!(message.contains("kv cache full")),
            other => panic!("Expected EngineFailure, got {other:?}"),
        }
        assert_eq!(session.history_len(), 0);
        assert_eq!(session.state(), SessionState::Idle);

        // Still usable
        assert!(session.generate("again").await.is_err());
        assert_eq!(engine.calls(), 2);
    }

    #[tokio::test]
    async fn load_missing_file_fails_without_engine_call() {
        let engine = ScriptedEngine::new(&[]);
        let session = ChatSession::new(engine.clone());

        let err = session.load_model("/no/such/model.gguf").await.unwrap_err();
        assert!(matches!(err, GenerationError::EngineFailure { .. }));
        assert!(!session.is_model_loaded());
        assert_eq!(engine.next_handle.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reload_frees_previous_model_and_clears_history() {
        let engine = ScriptedEngine::new(&["ok"]);
        let (session, first) = loaded_session(engine.clone()).await;
        session.generate("q").await.unwrap();

        let second = model_file();
        let info = session.load_model(second.path()).await.unwrap();

        assert_eq!(engine.freed(), vec![EngineHandle::new(1).unwrap()]);
        assert_eq!(session.history_len(), 0);
        assert_eq!(info.path, second.path());
        assert_eq!(session.model_info().unwrap().path, second.path());
        drop(first);
    }

    #[tokio::test]
    async fn release_frees_once_and_is_idempotent() {
        let engine = ScriptedEngine::new(&["ok"]);
        let (session, _file) = loaded_session(engine.clone()).await;
        let mut events = session.subscribe();
        session.generate("q").await.unwrap();

        session.release().await;
        session.release().await;

        assert_eq!(engine.freed().len(), 1);
        assert!(!session.is_model_loaded());
        assert_eq!(session.history_len(), 0);
        assert_eq!(
            session.generate("q").await.unwrap_err(),
            GenerationError::ModelNotLoaded
        );

        let mut released = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let DomainEvent::ModelReleased { forced, .. } = *event {
                released.push(forced);
            }
        }
        assert_eq!(released, vec![false]);
    }

    #[tokio::test]
    async fn dropping_session_frees_model() {
        let engine = ScriptedEngine::new(&[]);
        let (session, _file) = loaded_session(engine.clone()).await;
        let clone = session.clone();

        drop(session);
        assert!(engine.freed().is_empty());
        drop(clone);
        assert_eq!(engine.freed().len(), 1);
    }

    #[tokio::test]
    async fn generate_stream_ends_with_one_terminal_event() {
        let engine = ScriptedEngine::new(&["a", "b"]);
        let (session, _file) = loaded_session(engine).await;

        let mut rx = session.generate_stream("q").unwrap();
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        assert_eq!(
            events,
            vec![
                GenerationEvent::Token { content: "a".into() },
                GenerationEvent::Token { content: "b".into() },
                GenerationEvent::Done {
                    text: "ab".into(),
                    tokens: 2
                },
            ]
        );
        assert_eq!(session.history_len(), 1);
    }

    #[tokio::test]
    async fn generate_stream_checks_preconditions_synchronously() {
        let session = ChatSession::new(ScriptedEngine::new(&[]));
        let err = session.generate_stream("q").unwrap_err();
        assert_eq!(err, GenerationError::ModelNotLoaded);
    }

    #[tokio::test]
    async fn generate_stream_reports_engine_failure() {
        let engine = ScriptedEngine::failing(EngineError::Inference("boom".into()));
        let (session, _file) = loaded_session(engine).await;

        let mut rx = session.generate_stream("q").unwrap();
        let event = rx.recv().await.unwrap();
        match event {
            GenerationEvent::Error { message } => assert!(message.contains("boom")),
            other => panic!("Expected Error event, got {other:?}"),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn mode_toggles() {
        let session = ChatSession::new(ScriptedEngine::new(&[]));
        assert_eq!(session.mode(), GenerationMode::Streaming);
        assert_eq!(session.toggle_mode(), GenerationMode::Static);
        assert_eq!(session.toggle_mode(), GenerationMode::Streaming);
    }

    #[tokio::test]
    async fn cancel_when_idle_is_noop() {
        let session = ChatSession::new(ScriptedEngine::new(&[]));
        session.cancel();
        session.cancel();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn lifecycle_events_are_published() {
        let engine = ScriptedEngine::new(&["ok"]);
        let session = ChatSession::new(engine);
        let mut events = session.subscribe();
        let file = model_file();

        session.load_model(file.path()).await.unwrap();
        session.generate("q").await.unwrap();
        session.clear_history();

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(match *event {
                DomainEvent::ModelLoaded { .. } => "loaded",
                DomainEvent::GenerationStarted { .. } => "started",
                DomainEvent::GenerationCompleted { .. } => "completed",
                DomainEvent::HistoryCleared { turns_removed, .. } => {
                    assert_eq!(turns_removed, 1);
                    "cleared"
                }
                _ => "other",
            });
        }
        assert_eq!(kinds, vec!["loaded", "started", "completed", "cleared"]);
    }

    #[tokio::test]
    async fn builder_rejects_invalid_config() {
        let bad = SessionConfig {
            max_tokens: 0,
            ..SessionConfig::default()
        };
        let result = ChatSession::builder(ScriptedEngine::new(&[]))
            .with_config(bad)
            .build();
        assert!(matches!(
            result,
            Err(GenerationError::Validation { field: "max_tokens", .. })
        ));
    }

    #[tokio::test]
    async fn builder_applies_app_config() {
        let mut app = AppConfig::default();
        app.streaming = false;
        app.session.max_history_pairs = 3;

        let session = SessionBuilder::from_app_config(ScriptedEngine::new(&[]), &app)
            .build()
            .unwrap();
        assert_eq!(session.mode(), GenerationMode::Static);
        assert_eq!(session.config().max_history_pairs, 3);
    }
}
