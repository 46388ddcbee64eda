//! Persistence bridge
//!
//! Commits are idempotent by message id: a commit for a server-assigned id
//! updates that record in place. Ephemeral conversations and a backend
//! reporting `Unavailable` fall back to `MemoryStore`.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{ChatBackend, MemoryStore, MessageUpdate};
use crate::error::PersistenceError;
use crate::message::{Backing, Message, MessageFlags, MessageId, Role};

pub struct PersistenceBridge {
    backend: Option<Arc<dyn ChatBackend>>,
    memory: MemoryStore,
}

impl PersistenceBridge {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            backend: Some(backend),
            memory: MemoryStore::new(),
        }
    }

    /// Bridge with no durable backend; everything stays in memory
    pub fn in_memory() -> Self {
        Self {
            backend: None,
            memory: MemoryStore::new(),
        }
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn backend(&self) -> Option<&Arc<dyn ChatBackend>> {
        self.backend.as_ref()
    }

    fn durable(&self, backing: Backing) -> Option<&Arc<dyn ChatBackend>> {
        match backing {
            Backing::Durable => self.backend.as_ref(),
            Backing::Ephemeral => None,
        }
    }

    pub async fn commit_user_message(
        &self,
        conversation_id: &str,
        backing: Backing,
        text: &str,
    ) -> Result<Message, PersistenceError> {
        self.create(conversation_id, backing, Role::User, text).await
    }

    /// Create the empty assistant record the stream will fill in
    pub async fn allocate_placeholder(
        &self,
        conversation_id: &str,
        backing: Backing,
    ) -> Result<Message, PersistenceError> {
        let mut placeholder = self
            .create(conversation_id, backing, Role::Assistant, "")
            .await?;
        placeholder.is_partial = true;
        Ok(placeholder)
    }

    /// Write the final assistant text and flags over the placeholder
    pub async fn commit_assistant_message(
        &self,
        conversation_id: &str,
        backing: Backing,
        placeholder_id: &MessageId,
        final_text: &str,
        flags: MessageFlags,
    ) -> Result<Message, PersistenceError> {
        let update = MessageUpdate::new(final_text, flags);

        if placeholder_id.is_server_assigned() {
            if let Some(backend) = self.durable(backing) {
                match backend.update_message(placeholder_id, update.clone()).await {
                    Ok(message) => {
                        debug!(message_id = %placeholder_id, "Committed assistant message");
                        return Ok(message);
                    }
                    Err(PersistenceError::Unavailable(reason)) => {
                        warn!(
                            message_id = %placeholder_id,
                            "Backend unavailable, keeping final message in memory: {}",
                            reason
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(self
            .memory
            .commit(conversation_id, Role::Assistant, placeholder_id, update))
    }

    async fn create(
        &self,
        conversation_id: &str,
        backing: Backing,
        role: Role,
        content: &str,
    ) -> Result<Message, PersistenceError> {
        let Some(backend) = self.durable(backing) else {
            return Ok(self.memory.create(conversation_id, role, content));
        };

        match backend.create_message(conversation_id, role, content).await {
            Ok(message) => Ok(message),
            Err(PersistenceError::Unavailable(reason)) => {
                warn!(
                    conversation_id = %conversation_id,
                    "Backend unavailable, storing {} message in memory: {}",
                    role,
                    reason
                );
                Ok(self.memory.create(conversation_id, role, content))
            }
            Err(e) => Err(e),
        }
    }
}
