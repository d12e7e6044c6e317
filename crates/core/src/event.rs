//! Domain event system: decoupled observation of session lifecycle.
//!
//! Events are published when something interesting happens in a session.
//! Front-ends and diagnostics subscribe to react without tight coupling.

use crate::session::GenerationMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A model was bound to a session
    ModelLoaded {
        session_id: String,
        path: PathBuf,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A session's model binding was freed
    ModelReleased {
        session_id: String,
        /// Whether the grace period ran out while a generation was still running
        forced: bool,
        timestamp: DateTime<Utc>,
    },

    /// A generation acquired the session's single-flight guard
    GenerationStarted {
        session_id: String,
        mode: GenerationMode,
        prompt_chars: usize,
        timestamp: DateTime<Utc>,
    },

    /// A generation finished and its turn was appended to history
    GenerationCompleted {
        session_id: String,
        tokens_delivered: usize,
        response_chars: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A generation finished after cancellation was requested
    GenerationCancelled {
        session_id: String,
        tokens_delivered: usize,
        timestamp: DateTime<Utc>,
    },

    /// A generation failed; history was left untouched
    GenerationFailed {
        session_id: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },

    /// The session's config snapshot was replaced
    ConfigChanged {
        session_id: String,
        timestamp: DateTime<Utc>,
    },

    /// The session's history was cleared
    HistoryCleared {
        session_id: String,
        turns_removed: usize,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
/// Components can subscribe to receive all events and filter for what they care about.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
