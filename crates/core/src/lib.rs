//! # Quill Core
//!
//! Domain types, traits, and error definitions for the Quill chat runtime.
//! This crate has **no engine or I/O dependencies**: it defines the domain
//! model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! The inference backend is defined as a trait here ([`InferenceEngine`]).
//! Implementations live in `quill-engine`; the orchestration that drives them
//! lives in `quill-session`. Tests swap in scripted engines.

pub mod engine;
pub mod error;
pub mod event;
pub mod message;
pub mod model;
pub mod session;

// Re-export key types at crate root for ergonomics
pub use engine::{EngineHandle, InferenceEngine, SamplingParams, StopSignal};
pub use error::{EngineError, GenerationError, ValidationError};
pub use event::{DomainEvent, EventBus};
pub use message::{History, IM_END, IM_START, Role, Turn};
pub use model::{ModelEntry, ModelInfo};
pub use session::{GenerationMode, SessionConfig, SessionId, SessionState};
