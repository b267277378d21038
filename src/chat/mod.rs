//! Chat view layer: message feed, typing indicators, send flow.

pub mod controller;
pub mod typing;

pub use controller::{ChatController, ChatPhase, SendPath};
pub use typing::TypingTracker;
