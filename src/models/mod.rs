//! Data models for tickets, messages, users, and realtime frames.

pub mod frame;
pub mod ticket;
pub mod user;

pub use frame::*;
pub use ticket::*;
pub use user::*;
