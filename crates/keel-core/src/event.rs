use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::sync::Arc;
use tokio::sync::broadcast;

/// Host-level lifecycle notifications.
///
/// These are for host observers (the CLI, logs, future UIs). Extensions never
/// see them; extension-facing hooks go through the runtime's hook bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    ExtensionActivated {
        name: String,
        version: String,
    },
    ExtensionDisabled {
        name: String,
    },
    ExtensionUnloaded {
        name: String,
        files_removed: bool,
    },
    ExtensionRejected {
        /// Extension name if the manifest got far enough to have one, else the path.
        source: String,
        error_kind: String,
        error: String,
    },
    CommandInvoked {
        command: String,
        extension: String,
        is_error: bool,
        at: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for host observers.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<Event>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: Event) {
        // Ignore send errors (no subscribers).
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
