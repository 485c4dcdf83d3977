//! Callback registry routing inbound frames to user handlers.
//!
//! Handlers register under a category (message, event, status) and a key,
//! either a specific type or the wildcard. Each handler gets its own worker
//! task fed by a bounded queue, so a slow or panicking handler never blocks
//! the reader path or its neighbors, and each handler observes events in
//! arrival order.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Wildcard key: receives every type within the category.
pub const WILDCARD: &str = "*";

/// Queue depth per registered handler.
const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Handler categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackCategory {
    /// Inbound chat messages (numeric frame types).
    Message,
    /// Server events (group changes, presence of others).
    Event,
    /// Connection status changes.
    Status,
}

impl std::fmt::Display for CallbackCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message => write!(f, "message"),
            Self::Event => write!(f, "event"),
            Self::Status => write!(f, "status"),
        }
    }
}

/// One delivery to a handler.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub category: CallbackCategory,
    /// The concrete type within the category ("0", "pong", "connected", ...).
    pub kind: String,
    pub payload: Value,
}

/// Registry of user handlers, keyed by category and type.
///
/// There is no unregister: handlers live as long as the registry, matching
/// the subscribe-for-lifetime model of the client.
pub struct CallbackRegistry {
    slots: Mutex<HashMap<(CallbackCategory, String), Vec<mpsc::Sender<Dispatch>>>>,
    queue_depth: usize,
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

impl CallbackRegistry {
    /// Create a registry with the given per-handler queue depth.
    pub fn new(queue_depth: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Register a handler for `key` within `category`; `None` subscribes to
    /// every type in the category.
    ///
    /// Handlers are appended: registering twice delivers twice. Must be
    /// called from within a tokio runtime since each handler gets a worker
    /// task.
    pub fn register<F>(&self, category: CallbackCategory, key: Option<&str>, callback: F)
    where
        F: Fn(&Dispatch) + Send + 'static,
    {
        let key = key.unwrap_or(WILDCARD).to_string();
        let (tx, mut rx) = mpsc::channel::<Dispatch>(self.queue_depth);

        let worker_key = format!("{category}/{key}");
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let result = catch_unwind(AssertUnwindSafe(|| callback(&event)));
                if result.is_err() {
                    warn!("handler for {worker_key} panicked on {} event", event.kind);
                }
            }
        });

        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry((category, key)).or_default().push(tx);
    }

    /// Deliver `payload` to every handler registered for (`category`,
    /// `kind`) and every wildcard handler in the category.
    ///
    /// Never blocks: a handler whose queue is full has the event dropped
    /// with a warning.
    pub fn dispatch(&self, category: CallbackCategory, kind: &str, payload: Value) {
        let event = Dispatch {
            category,
            kind: kind.to_string(),
            payload,
        };

        let targets: Vec<mpsc::Sender<Dispatch>> = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let mut targets = Vec::new();
            for key in [kind, WILDCARD] {
                if let Some(senders) = slots.get_mut(&(category, key.to_string())) {
                    senders.retain(|tx| !tx.is_closed());
                    targets.extend(senders.iter().cloned());
                }
            }
            targets
        };

        if targets.is_empty() {
            debug!("no handlers for {category}/{kind}");
            return;
        }

        for tx in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("handler queue full for {category}/{kind}, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Number of live handlers registered for (`category`, `key`).
    pub fn handler_count(&self, category: CallbackCategory, key: Option<&str>) -> usize {
        let key = key.unwrap_or(WILDCARD).to_string();
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .get(&(category, key))
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}
