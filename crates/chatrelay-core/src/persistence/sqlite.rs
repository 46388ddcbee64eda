//! SQLite chat backend
//!
//! `rusqlite::Connection` is blocking, so every call runs on the blocking
//! pool behind the shared database mutex.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use super::database::{Database, SharedDatabase};
use super::{ChatBackend, ChatRecord, MessageUpdate};
use crate::error::PersistenceError;
use crate::message::{Message, MessageId, Role};

pub struct SqliteChatBackend {
    db: SharedDatabase,
}

impl SqliteChatBackend {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    /// Open the database file, migrating it if needed
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        let db = Database::new(path).map_err(|e| PersistenceError::Unavailable(e.to_string()))?;
        Ok(Self::new(db.into_shared()))
    }

    async fn with_db<T, F>(&self, f: F) -> Result<T, PersistenceError>
    where
        F: FnOnce(&Database) -> Result<T, PersistenceError> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let db = db.lock();
            f(&db)
        })
        .await
        .map_err(|e| PersistenceError::Task(e.to_string()))?
    }
}

const MESSAGE_COLUMNS: &str = "id, chat_id, role, content, created_at, is_partial, is_error";

fn parse_time(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get(2)?;
    let created_at: String = row.get(4)?;
    Ok(Message {
        id: MessageId::Server(row.get(0)?),
        conversation_id: row.get(1)?,
        role: Role::parse(&role).unwrap_or(Role::Assistant),
        content: row.get(3)?,
        created_at: parse_time(&created_at),
        is_partial: row.get(5)?,
        is_error: row.get(6)?,
    })
}

fn load_message(db: &Database, id: &str) -> Result<Message, PersistenceError> {
    db.conn()
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            [id],
            message_from_row,
        )
        .optional()?
        .ok_or_else(|| PersistenceError::NotFound(format!("message {id}")))
}

fn touch_chat(db: &Database, chat_id: &str, now: &str) -> Result<(), PersistenceError> {
    let updated = db.conn().execute(
        "UPDATE chats SET updated_at = ?1 WHERE id = ?2",
        params![now, chat_id],
    )?;
    if updated == 0 {
        return Err(PersistenceError::NotFound(format!("chat {chat_id}")));
    }
    Ok(())
}

#[async_trait]
impl ChatBackend for SqliteChatBackend {
    async fn create_chat(&self, title: &str) -> Result<ChatRecord, PersistenceError> {
        let title = title.to_string();
        self.with_db(move |db| {
            let id = uuid::Uuid::new_v4().to_string();
            let now = Utc::now();
            db.conn().execute(
                "INSERT INTO chats (id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                params![id, title, now.to_rfc3339()],
            )?;
            debug!(chat_id = %id, "Created chat");
            Ok(ChatRecord {
                id,
                title,
                created_at: now,
                updated_at: now,
                messages: Vec::new(),
            })
        })
        .await
    }

    async fn create_message(
        &self,
        chat_id: &str,
        role: Role,
        content: &str,
    ) -> Result<Message, PersistenceError> {
        let chat_id = chat_id.to_string();
        let content = content.to_string();
        self.with_db(move |db| {
            let id = uuid::Uuid::new_v4().to_string();
            let now = Utc::now().to_rfc3339();
            touch_chat(db, &chat_id, &now)?;
            db.conn().execute(
                "INSERT INTO messages (id, chat_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, chat_id, role.as_str(), content, now],
            )?;
            load_message(db, &id)
        })
        .await
    }

    async fn update_message(
        &self,
        id: &MessageId,
        update: MessageUpdate,
    ) -> Result<Message, PersistenceError> {
        let MessageId::Server(id) = id else {
            return Err(PersistenceError::NotFound(format!(
                "local message {id} is not stored durably"
            )));
        };
        let id = id.clone();
        self.with_db(move |db| {
            let updated = db.conn().execute(
                "UPDATE messages SET content = ?1, is_partial = ?2, is_error = ?3 WHERE id = ?4",
                params![update.content, update.is_partial, update.is_error, id],
            )?;
            if updated == 0 {
                return Err(PersistenceError::NotFound(format!("message {id}")));
            }
            let message = load_message(db, &id)?;
            touch_chat(db, &message.conversation_id, &Utc::now().to_rfc3339())?;
            Ok(message)
        })
        .await
    }

    async fn get_chat_by_id(&self, id: &str) -> Result<Option<ChatRecord>, PersistenceError> {
        let id = id.to_string();
        self.with_db(move |db| {
            let chat = db
                .conn()
                .query_row(
                    "SELECT id, title, created_at, updated_at FROM chats WHERE id = ?1",
                    [&id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?;

            let Some((id, title, created_at, updated_at)) = chat else {
                return Ok(None);
            };

            let mut stmt = db.conn().prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = ?1 ORDER BY rowid"
            ))?;
            let messages = stmt
                .query_map([&id], message_from_row)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(Some(ChatRecord {
                id,
                title,
                created_at: parse_time(&created_at),
                updated_at: parse_time(&updated_at),
                messages,
            }))
        })
        .await
    }
}
