use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use tracing::warn;

use parley_db::Database;
use parley_db::models::{MessageRow, NewMessage};
use parley_types::models::{ChatMessage, RoomKey};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("corrupt message row {id}: {detail}")]
    Corrupt { id: String, detail: String },

    #[error("store call timed out")]
    Timeout,

    #[error("store task failed: {0}")]
    Task(String),
}

/// Result of an append. Appends are keyed on the message id, so a retried
/// send never produces a second row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Appended {
    Inserted,
    /// A message with this id was already stored; this is the stored copy.
    Existing(ChatMessage),
}

/// The durable message log. The gateway owns none of it; it only appends,
/// reads back and wipes whole rooms.
///
/// Calls are blocking and are always issued from `spawn_blocking`.
pub trait MessageStore: Send + Sync + 'static {
    fn append_message(&self, message: &ChatMessage) -> Result<Appended, StoreError>;

    /// Ordered oldest first. An unknown room yields an empty list.
    fn fetch_messages(&self, room_key: &RoomKey) -> Result<Vec<ChatMessage>, StoreError>;

    fn delete_room_messages(&self, room_key: &RoomKey) -> Result<usize, StoreError>;
}

impl MessageStore for Database {
    fn append_message(&self, message: &ChatMessage) -> Result<Appended, StoreError> {
        let id = message.id.to_string();
        let sent_at = message.sent_at.to_rfc3339_opts(SecondsFormat::Micros, true);
        let inserted = self
            .insert_message(&NewMessage {
                id: &id,
                room_key: message.room_key.as_str(),
                sender_id: message.sender_id.as_str(),
                receiver_id: message.receiver_id.as_str(),
                sender_role: message.sender_role.as_str(),
                receiver_role: message.receiver_role.as_str(),
                body: &message.body,
                sent_at: &sent_at,
            })
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if inserted.is_some() {
            return Ok(Appended::Inserted);
        }

        let row = self
            .get_message(&id)
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .ok_or_else(|| StoreError::Backend(format!("message {id} vanished after conflict")))?;
        Ok(Appended::Existing(row_to_message(row)?))
    }

    fn fetch_messages(&self, room_key: &RoomKey) -> Result<Vec<ChatMessage>, StoreError> {
        let rows = self
            .get_room_messages(room_key.as_str())
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            match row_to_message(row) {
                Ok(message) => messages.push(message),
                // A single bad row must not hide the rest of the conversation
                Err(e) => warn!("Skipping message: {}", e),
            }
        }
        Ok(messages)
    }

    fn delete_room_messages(&self, room_key: &RoomKey) -> Result<usize, StoreError> {
        Database::delete_room_messages(self, room_key.as_str())
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

fn row_to_message(row: MessageRow) -> Result<ChatMessage, StoreError> {
    let corrupt = |detail: String| StoreError::Corrupt {
        id: row.id.clone(),
        detail,
    };

    Ok(ChatMessage {
        id: row.id.parse().map_err(|e| corrupt(format!("id: {e}")))?,
        room_key: row
            .room_key
            .parse()
            .map_err(|e| corrupt(format!("room_key: {e}")))?,
        sender_id: row
            .sender_id
            .parse()
            .map_err(|e| corrupt(format!("sender_id: {e}")))?,
        receiver_id: row
            .receiver_id
            .parse()
            .map_err(|e| corrupt(format!("receiver_id: {e}")))?,
        sender_role: row.sender_role.parse().map_err(corrupt)?,
        receiver_role: row.receiver_role.parse().map_err(corrupt)?,
        sent_at: DateTime::parse_from_rfc3339(&row.sent_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| corrupt(format!("sent_at: {e}")))?,
        body: row.body,
    })
}
