//! Session-level streaming events.
//!
//! `GenerationEvent` is what [`ChatSession::generate_stream`](crate::ChatSession::generate_stream)
//! yields: token events in engine order, then exactly one terminal event.

use serde::{Deserialize, Serialize};

/// Events emitted while a generation runs.
///
/// - `token`: a piece of reply text, in emission order
/// - `done`: the generation finished; carries the cleaned reply
/// - `error`: the generation failed; history was left untouched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEvent {
    /// Partial text from the engine.
    Token { content: String },

    /// The generation is complete.
    Done {
        /// The cleaned reply, as appended to history.
        text: String,
        /// Number of token events delivered before this one.
        tokens: usize,
    },

    /// The generation failed.
    Error { message: String },
}

impl GenerationEvent {
    /// Event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Token { .. } => "token",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Token { .. })
    }
}
