//! JSON frames exchanged over the realtime ticket connection.

use serde::{Deserialize, Serialize};

use crate::models::ticket::ChatMessage;

/// Event kinds a subscriber can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    Typing,
    ClearTyping,
}

/// Frame sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Message { content: String },
    Typing,
}

/// Frame received from the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Message { message: ChatMessage },
    Typing { username: String },
    ClearTyping { username: String },
}

impl ServerFrame {
    /// Event kind used to route the frame to subscribers.
    pub fn kind(&self) -> EventKind {
        match self {
            ServerFrame::Message { .. } => EventKind::Message,
            ServerFrame::Typing { .. } => EventKind::Typing,
            ServerFrame::ClearTyping { .. } => EventKind::ClearTyping,
        }
    }
}
