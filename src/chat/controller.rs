//! Chat view controller: drives one ticket conversation.
//!
//! Keeps a newest-first, de-duplicated message feed, a transient
//! typing-indicator set, and the conversation phase. User actions are
//! delegated to the connection manager, with the REST API as the
//! fallback send path while the realtime channel is down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::api::{validate_content, ApiClient};
use crate::error::{ChatError, ChatResult};
use crate::models::frame::{EventKind, ServerFrame};
use crate::models::ticket::{ChatMessage, Ticket};
use crate::ws::registry::HandlerId;
use crate::ws::{ConnectionManager, ConnectionState, SendOutcome};

use super::typing::TypingTracker;

/// Conversation phase for one chat screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatPhase {
    /// History fetch in flight (or failed; retry by calling `load` again).
    Loading,
    /// History loaded, realtime connection not established or lost.
    ReadyDisconnected,
    /// Realtime connection open; inbound events update state directly.
    ReadyConnected,
    /// The conversation was closed by a participant. Terminal.
    Closed,
}

/// Which path carried a successful send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPath {
    /// Sent over the realtime channel; the server echo populates the feed.
    Realtime,
    /// Created via REST; the returned message was inserted directly.
    Rest,
}

pub struct ChatController {
    api: ApiClient,
    conn: Arc<ConnectionManager>,
    ticket_id: i64,
    /// Newest-first message feed.
    feed: Arc<Mutex<Vec<ChatMessage>>>,
    typing: TypingTracker,
    /// Username behind the session token, for self-exclusion.
    me: Arc<Mutex<Option<String>>>,
    phase: Arc<Mutex<ChatPhase>>,
    send_in_flight: AtomicBool,
    handlers: Mutex<Vec<(EventKind, HandlerId)>>,
    status_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChatController {
    pub fn new(api: ApiClient, conn: Arc<ConnectionManager>, ticket_id: i64) -> Self {
        Self {
            api,
            conn,
            ticket_id,
            feed: Arc::new(Mutex::new(Vec::new())),
            typing: TypingTracker::new(),
            me: Arc::new(Mutex::new(None)),
            phase: Arc::new(Mutex::new(ChatPhase::Loading)),
            send_in_flight: AtomicBool::new(false),
            handlers: Mutex::new(Vec::new()),
            status_task: Mutex::new(None),
        }
    }

    /// Fetch identity, ticket metadata, and history. History arrives
    /// oldest-first and is reversed for the prepend-based feed. On
    /// error the phase stays `Loading` so the caller can retry.
    pub async fn load(&self) -> ChatResult<Ticket> {
        *self.phase.lock().unwrap() = ChatPhase::Loading;

        let user = self.api.current_user().await?;
        *self.me.lock().unwrap() = Some(user.username);

        let ticket = self.api.get_ticket(self.ticket_id).await?;
        let mut history = ticket.messages.clone();
        history.reverse();
        *self.feed.lock().unwrap() = history;

        *self.phase.lock().unwrap() = if ticket.status.is_open() {
            ChatPhase::ReadyDisconnected
        } else {
            ChatPhase::Closed
        };
        info!(ticket_id = self.ticket_id, messages = ticket.messages.len(), "ticket loaded");
        Ok(ticket)
    }

    /// Register event handlers and open the realtime connection.
    /// Handlers are installed before connecting so no early frame is
    /// missed; re-invocation replaces them rather than stacking.
    pub async fn connect_realtime(&self, token: &str) -> ChatResult<()> {
        self.attach_handlers();
        self.watch_connection();
        self.conn.connect(self.ticket_id, token).await?;
        self.sync_phase();
        Ok(())
    }

    /// Submit a message. Guards empty/whitespace content, a closed
    /// conversation, and concurrent double-submits. No optimistic
    /// insert on the realtime path; the echo populates the feed.
    pub async fn send(&self, content: &str) -> ChatResult<SendPath> {
        let content = validate_content(content)?.to_string();
        if *self.phase.lock().unwrap() == ChatPhase::Closed {
            return Err(ChatError::TicketClosed);
        }
        if self.send_in_flight.swap(true, Ordering::SeqCst) {
            return Err(ChatError::SendInFlight);
        }
        let result = self.send_guarded(&content).await;
        self.send_in_flight.store(false, Ordering::SeqCst);
        result
    }

    /// Forward a typing signal; throttling lives in the connection layer.
    pub fn notify_typing(&self) {
        self.conn.send_typing();
    }

    /// Close the conversation. Terminal for this screen; history stays
    /// viewable but sending is rejected from here on.
    pub async fn close_ticket(&self) -> ChatResult<Ticket> {
        let ticket = self.api.close_ticket(self.ticket_id).await?;
        *self.phase.lock().unwrap() = ChatPhase::Closed;
        info!(ticket_id = self.ticket_id, "ticket closed");
        Ok(ticket)
    }

    /// Snapshot of the feed, newest-first.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.feed.lock().unwrap().clone()
    }

    /// Authors currently typing (self excluded at ingestion).
    pub fn typing_users(&self) -> Vec<String> {
        self.typing.users()
    }

    pub fn phase(&self) -> ChatPhase {
        *self.phase.lock().unwrap()
    }

    /// Raw connection lifecycle, e.g. to surface a terminal `Failed`
    /// after the reconnect budget ran out.
    pub fn connection_state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// Tear down the screen: disconnect, drop subscriptions, cancel
    /// typing timers. Nothing fires after this returns.
    pub fn shutdown(&self) {
        if let Some(task) = self.status_task.lock().unwrap().take() {
            task.abort();
        }
        self.detach_handlers();
        self.typing.shutdown();
        self.conn.disconnect();
    }

    async fn send_guarded(&self, content: &str) -> ChatResult<SendPath> {
        if let SendOutcome::Sent = self.conn.send_message(content) {
            return Ok(SendPath::Realtime);
        }
        debug!(ticket_id = self.ticket_id, "realtime unavailable, using REST fallback");
        let message = self.api.create_message(self.ticket_id, content).await?;
        ingest_message(&mut self.feed.lock().unwrap(), message);
        Ok(SendPath::Rest)
    }

    fn attach_handlers(&self) {
        self.detach_handlers();
        let mut handlers = self.handlers.lock().unwrap();

        let feed = Arc::clone(&self.feed);
        let id = self.conn.on(EventKind::Message, move |frame| {
            if let ServerFrame::Message { message } = frame {
                ingest_message(&mut feed.lock().unwrap(), message.clone());
            }
        });
        handlers.push((EventKind::Message, id));

        let typing = self.typing.clone();
        let me = Arc::clone(&self.me);
        let id = self.conn.on(EventKind::Typing, move |frame| {
            if let ServerFrame::Typing { username } = frame {
                let is_self = me.lock().unwrap().as_deref() == Some(username.as_str());
                if !is_self {
                    typing.note(username);
                }
            }
        });
        handlers.push((EventKind::Typing, id));

        let typing = self.typing.clone();
        let id = self.conn.on(EventKind::ClearTyping, move |frame| {
            if let ServerFrame::ClearTyping { username } = frame {
                typing.clear(username);
            }
        });
        handlers.push((EventKind::ClearTyping, id));
    }

    fn detach_handlers(&self) {
        let mut handlers = self.handlers.lock().unwrap();
        for (kind, id) in handlers.drain(..) {
            self.conn.off(kind, id);
        }
    }

    /// Mirror the connection lifecycle into the conversation phase.
    /// `Closed` (conversation-level) and `Loading` are never overridden.
    fn watch_connection(&self) {
        let mut states = self.conn.watch_state();
        let phase = Arc::clone(&self.phase);
        let task = tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                let mut phase = phase.lock().unwrap();
                if matches!(*phase, ChatPhase::Closed | ChatPhase::Loading) {
                    continue;
                }
                *phase = match state {
                    ConnectionState::Open => ChatPhase::ReadyConnected,
                    _ => ChatPhase::ReadyDisconnected,
                };
            }
        });
        if let Some(old) = self.status_task.lock().unwrap().replace(task) {
            old.abort();
        }
    }

    fn sync_phase(&self) {
        let mut phase = self.phase.lock().unwrap();
        if matches!(*phase, ChatPhase::Closed | ChatPhase::Loading) {
            return;
        }
        *phase = if self.conn.is_connected() {
            ChatPhase::ReadyConnected
        } else {
            ChatPhase::ReadyDisconnected
        };
    }
}

/// Prepend `message` unless an entry with the same id already exists.
/// The duplicate case covers the sender's own echo arriving on top of a
/// REST-inserted copy, and repeated broker deliveries.
fn ingest_message(feed: &mut Vec<ChatMessage>, message: ChatMessage) {
    if feed.iter().any(|existing| existing.id == message.id) {
        debug!(id = message.id, "duplicate message discarded");
        return;
    }
    feed.insert(0, message);
}
