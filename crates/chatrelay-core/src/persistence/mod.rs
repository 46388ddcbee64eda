//! Persistence
//!
//! - `ChatBackend`: the durable chat store collaborator
//! - `SqliteChatBackend`: local SQLite implementation with versioned migrations
//! - `MemoryStore`: in-memory records for ephemeral chats and outages
//! - `PersistenceBridge`: exactly-once, id-idempotent commits across both

mod bridge;
mod database;
mod memory;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;
use crate::message::{Backing, Conversation, Message, MessageFlags, MessageId, Role};

pub use bridge::PersistenceBridge;
pub use database::{Database, SharedDatabase};
pub use memory::MemoryStore;
pub use sqlite::SqliteChatBackend;

/// A stored chat with its messages in send order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

impl ChatRecord {
    /// Load a stored chat as a durable, idle conversation
    pub fn into_conversation(self) -> Conversation {
        let mut conversation = Conversation::new(&self.id, &self.title, Backing::Durable);
        conversation.messages = self.messages;
        conversation.updated_at = self.updated_at;
        conversation
    }
}

/// Replacement content and flags for an existing message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageUpdate {
    pub content: String,
    pub is_partial: bool,
    pub is_error: bool,
}

impl MessageUpdate {
    pub fn new(content: &str, flags: MessageFlags) -> Self {
        Self {
            content: content.to_string(),
            is_partial: flags.is_partial,
            is_error: flags.is_error,
        }
    }
}

/// Durable chat storage
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn create_chat(&self, title: &str) -> Result<ChatRecord, PersistenceError>;

    /// Store a new message; the backend assigns its id
    async fn create_message(
        &self,
        chat_id: &str,
        role: Role,
        content: &str,
    ) -> Result<Message, PersistenceError>;

    async fn update_message(
        &self,
        id: &MessageId,
        update: MessageUpdate,
    ) -> Result<Message, PersistenceError>;

    async fn get_chat_by_id(&self, id: &str) -> Result<Option<ChatRecord>, PersistenceError>;
}
