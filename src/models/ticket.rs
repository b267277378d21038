//! Ticket and message models mirroring the platform API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One chat message inside a ticket. Immutable once created; the id is
/// unique per conversation and assigned by the remote system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub content: String,
    pub sent_time: DateTime<Utc>,
    pub edit_time: DateTime<Utc>,
    pub author_username: String,
}

/// Ticket lifecycle. Closed is terminal for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Open,
    Closed,
}

impl TicketStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, TicketStatus::Open)
    }
}

/// A support ticket tied to one challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: i64,
    pub status: TicketStatus,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub challenge_id: Option<i64>,
    #[serde(default)]
    pub challenge_name: Option<String>,
    #[serde(default)]
    pub created_by_username: Option<String>,
    pub created_time: DateTime<Utc>,
    /// Message history, oldest-first as returned by the API.
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

impl Ticket {
    /// Display id in the `TKT-001` form used across the platform UI.
    pub fn display_id(&self) -> String {
        format!("TKT-{:03}", self.id)
    }

    /// Time of the newest message, falling back to the creation time
    /// when the ticket has no messages yet.
    pub fn last_updated(&self) -> DateTime<Utc> {
        self.messages
            .iter()
            .map(|m| m.sent_time)
            .max()
            .unwrap_or(self.created_time)
    }
}
