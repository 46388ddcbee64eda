//! ChatRelay Core - streaming chat relay with tool-auth interrupts
//!
//! This crate provides the client side of a streaming chat:
//! - Stream transports (SSE, WebSocket, buffered POST) behind one event channel
//! - Message relay that folds fragments into an assistant placeholder
//! - Per-conversation state machine with auth and confirmation interrupts
//! - Persistence bridge over SQLite with in-memory fallback

pub mod auth;
pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod interrupt;
pub mod message;
pub mod paths;
pub mod persistence;
pub mod protocol;
pub mod relay;
pub mod state;
pub mod store;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use client::BackendClient;
pub use config::{RelayConfig, TransportKind};
pub use error::{PersistenceError, RelayError, RelayResult, TransportError};
pub use interrupt::{InterruptKind, InterruptRequest, InterruptResolution, ResumeToken};
pub use message::{Backing, Conversation, Message, MessageFlags, MessageId, Role};
pub use persistence::{ChatBackend, PersistenceBridge, SqliteChatBackend};
pub use relay::{MessageRelay, RelaySettings, SendOptions};
pub use state::ConversationStatus;
pub use store::{ConversationEvent, ConversationStore};
pub use transport::StreamTransport;
