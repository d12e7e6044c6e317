//! Chat session orchestration: the part of Quill between a front-end and an
//! inference engine.
//!
//! 1. **Build** a ChatML prompt from the system prompt, bounded history, and the new input
//! 2. **Admit** at most one generation per session (single-flight guard)
//! 3. **Run** the engine on the blocking pool, relaying tokens in order
//! 4. **Clean** the reply, append the turn, trim history
//!
//! Cancellation is cooperative: once requested, no further tokens reach the
//! caller, and engines that support interruption are asked to stop.

pub mod context;
pub mod coordinator;
pub mod stream_event;

pub use context::ContextBuilder;
pub use coordinator::{ChatSession, SessionBuilder};
pub use stream_event::GenerationEvent;
