//! Ordered event subscriptions for inbound realtime frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::models::frame::{EventKind, ServerFrame};

type Handler = Arc<dyn Fn(&ServerFrame) + Send + Sync>;

/// Handle returned by [`EventRegistry::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

/// Maps event kinds to ordered handler lists. Handlers are invoked in
/// subscription order; they run on the connection's reader task and
/// must not block.
pub struct EventRegistry {
    handlers: Mutex<HashMap<EventKind, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler for `kind`. Multiple handlers per kind are
    /// supported and keep their insertion order.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&ServerFrame) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.lock().unwrap();
        handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove one handler. Unknown ids are ignored.
    pub fn off(&self, kind: EventKind, id: HandlerId) {
        let mut handlers = self.handlers.lock().unwrap();
        if let Some(list) = handlers.get_mut(&kind) {
            list.retain(|(handler_id, _)| *handler_id != id);
        }
    }

    /// Drop all subscriptions. Called on manual disconnect.
    pub fn clear(&self) {
        self.handlers
            .lock()
            .unwrap()
            .clear();
    }

    /// Invoke every handler registered for the frame's kind, in order.
    /// The lock is released before invocation so handlers may themselves
    /// subscribe or unsubscribe.
    pub fn dispatch(&self, frame: &ServerFrame) {
        let kind = frame.kind();
        let matched: Vec<Handler> = {
            let handlers = self.handlers.lock().unwrap();
            match handlers.get(&kind) {
                Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => Vec::new(),
            }
        };
        if matched.is_empty() {
            debug!(?kind, "no subscribers for inbound frame");
            return;
        }
        for handler in matched {
            handler(frame);
        }
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}
