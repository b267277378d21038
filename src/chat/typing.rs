//! Transient typing indicators with automatic expiry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

/// How long an indicator stays visible without a clear signal.
pub const TYPING_EXPIRY: Duration = Duration::from_secs(8);

/// Set of authors currently typing. Each entry carries an expiry timer
/// that removes it unless an explicit clear (or a newer typing event)
/// arrives first. Timers never outlive [`TypingTracker::shutdown`].
#[derive(Clone)]
pub struct TypingTracker {
    expiry: Duration,
    entries: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::with_expiry(TYPING_EXPIRY)
    }

    pub fn with_expiry(expiry: Duration) -> Self {
        Self {
            expiry,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Mark `author` as typing and restart their expiry timer.
    /// Must run inside a tokio runtime.
    pub fn note(&self, author: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(old) = entries.remove(author) {
            old.abort();
        }
        let handle = tokio::spawn(expire_later(
            Arc::downgrade(&self.entries),
            author.to_string(),
            self.expiry,
        ));
        entries.insert(author.to_string(), handle);
    }

    /// Remove `author` immediately, cancelling the pending expiry.
    pub fn clear(&self, author: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(handle) = entries.remove(author) {
            handle.abort();
        }
    }

    pub fn is_typing(&self, author: &str) -> bool {
        self.entries.lock().unwrap().contains_key(author)
    }

    /// Currently-typing authors, sorted for stable display.
    pub fn users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.entries.lock().unwrap().keys().cloned().collect();
        users.sort();
        users
    }

    /// Cancel every pending timer. Called on screen teardown.
    pub fn shutdown(&self) {
        let mut entries = self.entries.lock().unwrap();
        for (_, handle) in entries.drain() {
            handle.abort();
        }
    }
}

impl Default for TypingTracker {
    fn default() -> Self {
        Self::new()
    }
}

async fn expire_later(entries: Weak<Mutex<HashMap<String, JoinHandle<()>>>>, author: String, expiry: Duration) {
    tokio::time::sleep(expiry).await;
    if let Some(entries) = entries.upgrade() {
        entries.lock().unwrap().remove(&author);
        debug!(author = %author, "typing indicator expired");
    }
}
