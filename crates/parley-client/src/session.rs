use chrono::Utc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use parley_types::events::{GatewayCommand, GatewayEvent};
use parley_types::models::{Identity, Notification, RoomKey, RoomKeyError, UserId};

use crate::timeline::Entry;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("expected Ready, got another event")]
    NotReady,

    #[error("{0} is not a participant of room {1}")]
    NotParticipant(UserId, RoomKey),

    #[error("message body is empty")]
    EmptyBody,

    #[error(transparent)]
    RoomKey(#[from] RoomKeyError),
}

/// The signed-in user, created at login and consumed at logout.
///
/// Everything that needs the caller's identity borrows it from here instead of
/// reading it from process-wide state.
#[derive(Debug, Clone)]
pub struct Session {
    identity: Identity,
    token: String,
}

impl Session {
    pub fn new(identity: Identity, token: impl Into<String>) -> Self {
        Self {
            identity,
            token: token.into(),
        }
    }

    /// Build a session from the server's `Ready` reply to `Identify { token }`.
    pub fn from_ready(token: impl Into<String>, ready: &GatewayEvent) -> Result<Self, SessionError> {
        match ready {
            GatewayEvent::Ready { user_id, role } => {
                Ok(Self::new(Identity::new(user_id.clone(), *role), token))
            }
            _ => Err(SessionError::NotReady),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn user_id(&self) -> &UserId {
        &self.identity.user_id
    }

    /// First frame to send on a fresh connection.
    pub fn identify(&self) -> GatewayCommand {
        GatewayCommand::Identify {
            token: self.token.clone(),
        }
    }

    /// Value for the REST `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    pub fn room_with(&self, partner: &UserId) -> Result<RoomKey, SessionError> {
        Ok(RoomKey::for_pair(&self.identity, partner)?)
    }

    pub fn join(&self, room_key: &RoomKey) -> GatewayCommand {
        GatewayCommand::JoinRoom {
            room_key: room_key.to_string(),
        }
    }

    pub fn leave(&self, room_key: &RoomKey) -> GatewayCommand {
        GatewayCommand::LeaveRoom {
            room_key: room_key.to_string(),
        }
    }

    /// Prepare a send: the command for the socket and the optimistic entry for the
    /// local timeline. Both carry the same fresh nonce, a UUID the server also
    /// uses as the message id.
    pub fn compose(
        &self,
        room_key: &RoomKey,
        body: &str,
    ) -> Result<(GatewayCommand, Entry), SessionError> {
        let me = self.user_id();
        let receiver = room_key
            .other(me)
            .ok_or_else(|| SessionError::NotParticipant(me.clone(), room_key.clone()))?;
        if body.trim().is_empty() {
            return Err(SessionError::EmptyBody);
        }

        let nonce = Uuid::new_v4().to_string();
        let command = GatewayCommand::ChatMessage {
            room_key: room_key.to_string(),
            receiver_id: receiver.to_string(),
            body: body.to_string(),
            nonce: Some(nonce.clone()),
        };
        let entry = Entry::pending(nonce, me.clone(), body.to_string(), Utc::now());
        Ok((command, entry))
    }

    /// Command to send a still-pending entry again after a failure. The nonce is
    /// reused, so the server stores the message at most once.
    pub fn resend(&self, room_key: &RoomKey, entry: &Entry) -> Option<GatewayCommand> {
        if !entry.is_pending() || entry.sender_id != *self.user_id() {
            return None;
        }
        let receiver = room_key.other(self.user_id())?;
        Some(GatewayCommand::ChatMessage {
            room_key: room_key.to_string(),
            receiver_id: receiver.to_string(),
            body: entry.body.clone(),
            nonce: entry.nonce.clone(),
        })
    }

    /// Whether a delivered notification should be shown to this user.
    pub fn should_surface(&self, notification: &Notification) -> bool {
        if notification.sender_id == *self.user_id() {
            debug!("Suppressing self-notification for {}", self.user_id());
            return false;
        }
        notification.recipient_id == *self.user_id()
    }

    /// End the session. The token is gone with it.
    pub fn logout(self) -> Identity {
        debug!("{} logged out", self.identity.user_id);
        self.identity
    }
}
