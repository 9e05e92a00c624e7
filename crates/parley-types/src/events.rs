use serde::{Deserialize, Serialize};

use crate::models::{ChatMessage, Notification, Role, RoomKey, UserId};

/// Why the core rejected something a client asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorReason {
    /// No valid identity on the connection.
    Unauthenticated,
    /// Malformed room key, sender/receiver mismatch, bad body.
    InvalidMessage,
    /// The durable store refused the operation.
    PersistenceFailure,
    /// The identity is not a participant of the room.
    Forbidden,
}

/// Events sent FROM server TO client over WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: UserId, role: Role },

    /// A counterpart's message was persisted in a room this connection is subscribed to
    ChatMessage(ChatMessage),

    /// The sender's own message was persisted. Only the sending connection gets this.
    MessageSent {
        nonce: Option<String>,
        message: ChatMessage,
    },

    /// New activity for this user, regardless of which room is open
    NotificationDelivered(Notification),

    /// A participant wiped the room's history
    RoomCleared { room_key: RoomKey, cleared_by: UserId },

    Error { reason: ErrorReason, message: String },
}

impl GatewayEvent {
    pub fn error(reason: ErrorReason, message: impl Into<String>) -> Self {
        Self::Error {
            reason,
            message: message.into(),
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Start receiving live messages for a room
    JoinRoom { room_key: String },

    LeaveRoom { room_key: String },

    /// Send a message to the other participant of a room.
    /// `nonce` is echoed back in `MessageSent` so the client can match its optimistic entry.
    ChatMessage {
        room_key: String,
        receiver_id: String,
        body: String,
        #[serde(default)]
        nonce: Option<String>,
    },

    /// Fire-and-forget nudge to another user's live connections
    SendNotification { recipient_id: String, excerpt: String },
}
