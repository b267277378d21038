//! Realtime connection layer: connection manager and event subscriptions.

pub mod connection;
pub mod registry;

pub use connection::{ConnectionManager, ConnectionState, SendOutcome, WsOptions};
pub use registry::{EventRegistry, HandlerId};
