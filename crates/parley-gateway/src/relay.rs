use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{SubsecRound, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parley_types::events::GatewayEvent;
use parley_types::models::{ChatMessage, Identity, RoomKey, UserId};

use crate::error::GatewayError;
use crate::membership::RoomMembership;
use crate::notify::Notifier;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::store::{Appended, MessageStore, StoreError};

pub const DEFAULT_MAX_BODY_LEN: usize = 4000;

/// Idle per-room locks are pruned once the table grows past this.
const ROOM_LOCK_PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upper bound on body length, in characters.
    pub max_body_len: usize,
    /// Store calls that take longer fail with `PersistenceFailure`. `None` waits forever.
    pub persist_timeout: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_body_len: DEFAULT_MAX_BODY_LEN,
            persist_timeout: None,
        }
    }
}

/// A chat message as submitted, before validation.
///
/// `sender` comes from the connection's verified identity, never from the client payload.
/// `id` is optional: a client that picks its own id can resend after a failure
/// without the log ever holding the message twice.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub id: Option<Uuid>,
    pub room_key: String,
    pub sender: Identity,
    pub receiver_id: String,
    pub body: String,
}

/// Validates, persists and re-broadcasts chat messages.
///
/// Sends are serialized per room: persist and broadcast happen under the room's
/// lock, so every subscriber sees a room's messages in persistence order.
/// Different rooms never contend.
pub struct Relay {
    store: Arc<dyn MessageStore>,
    registry: Arc<ConnectionRegistry>,
    membership: Arc<RoomMembership>,
    notifier: Arc<Notifier>,
    config: RelayConfig,
    room_locks: Mutex<HashMap<RoomKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl Relay {
    pub fn new(
        store: Arc<dyn MessageStore>,
        registry: Arc<ConnectionRegistry>,
        membership: Arc<RoomMembership>,
        notifier: Arc<Notifier>,
        config: RelayConfig,
    ) -> Self {
        Self {
            store,
            registry,
            membership,
            notifier,
            config,
            room_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Send a message from `origin`.
    ///
    /// Nothing is broadcast unless the store accepted the message. The sending
    /// connection is left out of the broadcast; the receiver is notified
    /// whether or not they have the room open. Resending an id that is already
    /// in the log relays the stored copy instead of writing a second one.
    pub async fn send(
        &self,
        origin: ConnectionId,
        draft: OutboundMessage,
    ) -> Result<ChatMessage, GatewayError> {
        let mut message = self.validate(draft)?;

        let room_lock = self.room_lock(&message.room_key);
        {
            let _turn = room_lock.lock().await;

            // Store precision, so the live copy equals the fetched one
            message.sent_at = Utc::now().trunc_subsecs(6);
            let to_store = message.clone();
            let appended = self
                .run_store(move |store| store.append_message(&to_store))
                .await
                .inspect_err(|e| {
                    error!(
                        "Failed to persist message {} in room {}: {}",
                        message.id, message.room_key, e
                    )
                })?;

            if let Appended::Existing(stored) = appended {
                if !is_retry_of(&stored, &message) {
                    return Err(GatewayError::InvalidMessage(format!(
                        "message id {} is already taken",
                        message.id
                    )));
                }
                debug!("Message {} was already stored, relaying the stored copy", stored.id);
                message = stored;
            }

            let delivered = self
                .membership
                .fan_out(
                    &self.registry,
                    &message.room_key,
                    Some(origin),
                    &GatewayEvent::ChatMessage(message.clone()),
                )
                .await;
            debug!(
                "Message {} in room {} delivered to {} subscribers",
                message.id, message.room_key, delivered
            );
        }

        self.notifier
            .notify(&message.receiver_id, &message.sender_id, &message.body)
            .await;

        Ok(message)
    }

    /// Full history of a room, oldest first. Only participants may read it.
    pub async fn history(
        &self,
        requester: &Identity,
        room_key: &RoomKey,
    ) -> Result<Vec<ChatMessage>, GatewayError> {
        ensure_participant(requester, room_key)?;
        let room = room_key.clone();
        let messages = self
            .run_store(move |store| store.fetch_messages(&room))
            .await?;
        Ok(messages)
    }

    /// Wipe a room's log and tell everyone currently viewing it.
    pub async fn clear_room(
        &self,
        requester: &Identity,
        room_key: &RoomKey,
    ) -> Result<usize, GatewayError> {
        ensure_participant(requester, room_key)?;

        let room_lock = self.room_lock(room_key);
        let _turn = room_lock.lock().await;

        let room = room_key.clone();
        let deleted = self
            .run_store(move |store| store.delete_room_messages(&room))
            .await
            .inspect_err(|e| error!("Failed to clear room {}: {}", room_key, e))?;

        let notified = self
            .membership
            .fan_out(
                &self.registry,
                room_key,
                None,
                &GatewayEvent::RoomCleared {
                    room_key: room_key.clone(),
                    cleared_by: requester.user_id.clone(),
                },
            )
            .await;

        info!(
            "{} cleared room {} ({} messages, {} viewers told)",
            requester.user_id, room_key, deleted, notified
        );
        Ok(deleted)
    }

    fn validate(&self, draft: OutboundMessage) -> Result<ChatMessage, GatewayError> {
        let room_key = RoomKey::parse(&draft.room_key)?;
        let receiver_id = UserId::new(draft.receiver_id)?;
        let sender = draft.sender;

        if sender.user_id == receiver_id {
            return Err(GatewayError::InvalidMessage(
                "sender and receiver are the same user".into(),
            ));
        }
        match room_key.other(&sender.user_id) {
            Some(other) if other == receiver_id => {}
            Some(_) => {
                return Err(GatewayError::InvalidMessage(format!(
                    "{receiver_id} is not the other participant of {room_key}"
                )));
            }
            None => {
                return Err(GatewayError::InvalidMessage(format!(
                    "{} is not a participant of {room_key}",
                    sender.user_id
                )));
            }
        }

        if draft.body.trim().is_empty() {
            return Err(GatewayError::InvalidMessage("message body is empty".into()));
        }
        let len = draft.body.chars().count();
        if len > self.config.max_body_len {
            warn!("{} sent an oversized message ({} chars)", sender.user_id, len);
            return Err(GatewayError::InvalidMessage(format!(
                "message body exceeds {} characters",
                self.config.max_body_len
            )));
        }

        Ok(ChatMessage {
            id: draft.id.unwrap_or_else(Uuid::new_v4),
            room_key,
            sender_id: sender.user_id,
            receiver_id,
            sender_role: sender.role,
            receiver_role: sender.role.counterpart(),
            body: draft.body,
            sent_at: Utc::now(),
        })
    }

    fn room_lock(&self, room_key: &RoomKey) -> Arc<tokio::sync::Mutex<()>> {
        // The table only holds `Arc`s, so a panic elsewhere cannot leave it half-updated
        let mut locks = self.room_locks.lock().unwrap_or_else(PoisonError::into_inner);

        if locks.len() > ROOM_LOCK_PRUNE_THRESHOLD {
            // Only the table holds an idle lock, so nobody can be waiting on it
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }

        locks.entry(room_key.clone()).or_default().clone()
    }

    /// Run a blocking store call off the async runtime, honouring `persist_timeout`.
    async fn run_store<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn MessageStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        let task = tokio::task::spawn_blocking(move || f(store.as_ref()));

        let joined = match self.config.persist_timeout {
            Some(limit) => tokio::time::timeout(limit, task)
                .await
                .map_err(|_| StoreError::Timeout)?,
            None => task.await,
        };

        joined.map_err(|e| StoreError::Task(e.to_string()))?
    }
}

/// A stored message with the same id is only a retry if it is the same send.
fn is_retry_of(stored: &ChatMessage, message: &ChatMessage) -> bool {
    stored.room_key == message.room_key
        && stored.sender_id == message.sender_id
        && stored.receiver_id == message.receiver_id
        && stored.body == message.body
}

fn ensure_participant(identity: &Identity, room_key: &RoomKey) -> Result<(), GatewayError> {
    if room_key.includes(&identity.user_id) {
        Ok(())
    } else {
        Err(GatewayError::Forbidden(room_key.to_string()))
    }
}
