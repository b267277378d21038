//! Real-time support-ticket chat client for a CTF competition platform.
//!
//! Provides a WebSocket connection manager with bounded auto-reconnect
//! and an ordered event subscription registry, plus a chat controller
//! that keeps a de-duplicated, newest-first message feed with transient
//! typing indicators, falling back to the REST API when the realtime
//! channel is down.

pub mod api;
pub mod chat;
pub mod config;
pub mod error;
pub mod models;
pub mod ws;

pub use api::ApiClient;
pub use chat::{ChatController, ChatPhase, SendPath};
pub use config::Config;
pub use error::{ChatError, ChatResult};
pub use ws::{ConnectionManager, ConnectionState, SendOutcome, WsOptions};
