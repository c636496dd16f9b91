use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::clock::DayKey;
use crate::profile::ProfileField;

/// Invalidation notifications shared by the progress and challenge engines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// A completion record for `day_key` was written.
    DayCompletionChanged { user_id: String, day_key: DayKey },
    /// A profile field was edited.
    ProfileChanged { user_id: String, field: ProfileField },
}

impl Event {
    pub fn user_id(&self) -> &str {
        match self {
            Event::DayCompletionChanged { user_id, .. } => user_id,
            Event::ProfileChanged { user_id, .. } => user_id,
        }
    }

    /// Whether this event should trigger a progress recompute for `user_id`.
    pub fn invalidates_progress(&self, user_id: &str) -> bool {
        if self.user_id() != user_id {
            return false;
        }
        match self {
            Event::DayCompletionChanged { .. } => true,
            Event::ProfileChanged { field, .. } => field.affects_progress(),
        }
    }
}

/// Typed broadcast bus for [`Event`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: Event) {
        trace!(event = ?event, "emitting event");
        // no subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
