//! In-memory message records
//!
//! Backs ephemeral conversations and stands in for the durable backend
//! while it is unavailable. Ids are always `MessageId::Local`.

use dashmap::DashMap;

use super::MessageUpdate;
use crate::message::{Message, MessageId, Role};

#[derive(Default)]
pub struct MemoryStore {
    messages: DashMap<String, Vec<Message>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new message under a fresh local id
    pub fn create(&self, conversation_id: &str, role: Role, content: &str) -> Message {
        let message = Message::new(
            MessageId::local(),
            conversation_id,
            role,
            content.to_string(),
        );
        self.messages
            .entry(conversation_id.to_string())
            .or_default()
            .push(message.clone());
        message
    }

    /// Update the message with this id in place, creating it if unknown
    pub fn commit(
        &self,
        conversation_id: &str,
        role: Role,
        id: &MessageId,
        update: MessageUpdate,
    ) -> Message {
        let mut entry = self
            .messages
            .entry(conversation_id.to_string())
            .or_default();

        if let Some(existing) = entry.iter_mut().find(|m| &m.id == id) {
            existing.content = update.content;
            existing.is_partial = update.is_partial;
            existing.is_error = update.is_error;
            return existing.clone();
        }

        let mut message = Message::new(id.clone(), conversation_id, role, update.content);
        message.is_partial = update.is_partial;
        message.is_error = update.is_error;
        entry.push(message.clone());
        message
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.messages
            .get(conversation_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, conversation_id: &str, id: &MessageId) -> bool {
        self.messages
            .get(conversation_id)
            .is_some_and(|entry| entry.iter().any(|m| &m.id == id))
    }
}
