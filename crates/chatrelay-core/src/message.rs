//! Chat data model
//!
//! Messages, conversations and the identifiers that tie them to storage.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::state::ConversationStatus;

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message identifier with its provenance
///
/// Ids handed out by a durable backend are `Server`; ids generated in
/// memory when no backend is available are `Local` (`mock-msg-XXXXXX`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "origin", content = "value", rename_all = "lowercase")]
pub enum MessageId {
    Server(String),
    Local(String),
}

impl MessageId {
    /// Generate a fresh local id
    pub fn local() -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(constants::conversation::MOCK_ID_LEN)
            .map(char::from)
            .collect();
        MessageId::Local(format!("{}{}", constants::conversation::MOCK_ID_PREFIX, suffix))
    }

    pub fn as_str(&self) -> &str {
        match self {
            MessageId::Server(id) | MessageId::Local(id) => id,
        }
    }

    /// Whether a durable backend assigned this id
    pub fn is_server_assigned(&self) -> bool {
        matches!(self, MessageId::Server(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completion flags attached to an assistant message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFlags {
    pub is_partial: bool,
    pub is_error: bool,
}

impl MessageFlags {
    /// Finished successfully
    pub const COMPLETE: MessageFlags = MessageFlags {
        is_partial: false,
        is_error: false,
    };

    /// Terminal failure with no usable partial content
    pub const FAILED: MessageFlags = MessageFlags {
        is_partial: false,
        is_error: true,
    };

    /// Stream broke after some content arrived
    pub const INTERRUPTED: MessageFlags = MessageFlags {
        is_partial: true,
        is_error: true,
    };
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_partial: bool,
    pub is_error: bool,
}

impl Message {
    pub fn new(id: MessageId, conversation_id: &str, role: Role, content: String) -> Self {
        Self {
            id,
            conversation_id: conversation_id.to_string(),
            role,
            content,
            created_at: Utc::now(),
            is_partial: false,
            is_error: false,
        }
    }

    pub fn flags(&self) -> MessageFlags {
        MessageFlags {
            is_partial: self.is_partial,
            is_error: self.is_error,
        }
    }

    pub fn apply_flags(&mut self, flags: MessageFlags) {
        self.is_partial = flags.is_partial;
        self.is_error = flags.is_error;
    }
}

/// Whether a conversation is backed by durable storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backing {
    Durable,
    /// Lives only in memory; never written to the persistence collaborator
    Ephemeral,
}

/// A conversation and its ordered messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub updated_at: DateTime<Utc>,
    pub status: ConversationStatus,
    pub backing: Backing,
    /// Reason the most recent exchange ended in the error state
    pub last_error: Option<String>,
}

impl Conversation {
    pub fn new(id: &str, title: &str, backing: Backing) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            messages: Vec::new(),
            updated_at: Utc::now(),
            status: ConversationStatus::Idle,
            backing,
            last_error: None,
        }
    }

    /// Append a message, or replace it in place when its id is already present
    pub fn upsert_message(&mut self, message: Message) {
        match self.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message,
            None => self.messages.push(message),
        }
        self.updated_at = Utc::now();
    }

    /// Replace the message stored under `old_id`, which may carry a new id
    ///
    /// Appends when `old_id` is unknown.
    pub fn replace_message(&mut self, old_id: &MessageId, message: Message) {
        match self.messages.iter_mut().find(|m| &m.id == old_id) {
            Some(existing) => {
                *existing = message;
                self.updated_at = Utc::now();
            }
            None => self.upsert_message(message),
        }
    }

    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_id_format() {
        let id = MessageId::local();
        let value = id.as_str();
        assert!(value.starts_with("mock-msg-"));
        let suffix = &value["mock-msg-".len()..];
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(!id.is_server_assigned());
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut conversation = Conversation::new("c1", "Test", Backing::Ephemeral);
        let first = Message::new(MessageId::local(), "c1", Role::User, "hi".into());
        let mut second = Message::new(MessageId::local(), "c1", Role::Assistant, String::new());
        conversation.upsert_message(first.clone());
        conversation.upsert_message(second.clone());

        second.content = "hello".to_string();
        conversation.upsert_message(second.clone());

        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[0].id, first.id);
        assert_eq!(conversation.messages[1].content, "hello");
    }

    #[test]
    fn test_replace_swaps_id_keeping_position() {
        let mut conversation = Conversation::new("c1", "Test", Backing::Durable);
        let user = Message::new(MessageId::local(), "c1", Role::User, "hi".into());
        let reply = Message::new(MessageId::local(), "c1", Role::Assistant, "yo".into());
        conversation.upsert_message(user.clone());
        conversation.upsert_message(reply.clone());

        let mut committed = user.clone();
        committed.id = MessageId::Server("srv-1".to_string());
        conversation.replace_message(&user.id, committed);

        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[0].id, MessageId::Server("srv-1".to_string()));
        assert_eq!(conversation.messages[1].id, reply.id);
    }

    #[test]
    fn test_role_round_trip_str() {
        for role in [Role::User, Role::Assistant, Role::System] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("tool"), None);
    }
}
