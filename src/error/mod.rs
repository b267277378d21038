//! Application error types for robust error handling.

use thiserror::Error;

/// Client-level errors.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("WebSocket error: {0}")]
    Ws(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Message content is empty")]
    EmptyContent,

    #[error("Ticket is closed")]
    TicketClosed,

    #[error("A send is already in flight")]
    SendInFlight,

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type ChatResult<T> = Result<T, ChatError>;
