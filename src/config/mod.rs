//! Application configuration loaded from environment.

/// Client configuration loaded from `.env` and environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Platform origin (e.g. `http://localhost:9999`). The realtime
    /// endpoint scheme is derived from it: http -> ws, https -> wss.
    pub base_url: String,
    /// Session token used for REST calls and the realtime handshake.
    pub token: String,
    /// Ticket to open on startup (binary only; library callers pass ids directly).
    pub ticket_id: Option<i64>,
    /// Log level: `error`, `warn`, `info`, `debug`, `trace`.
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment. Call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let base_url =
            std::env::var("CTF_BASE_URL").unwrap_or_else(|_| "http://localhost:9999".to_string());
        let token = std::env::var("CTF_TOKEN").map_err(|_| ConfigLoadError::MissingToken)?;
        let ticket_id = match std::env::var("CTF_TICKET_ID") {
            Ok(raw) => Some(raw.parse().map_err(|_| ConfigLoadError::InvalidTicketId)?),
            Err(_) => None,
        };
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            base_url,
            token,
            ticket_id,
            log_level,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("CTF_TOKEN must be set")]
    MissingToken,
    #[error("Invalid CTF_TICKET_ID")]
    InvalidTicketId,
}
