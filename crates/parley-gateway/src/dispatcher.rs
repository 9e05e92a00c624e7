use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use parley_types::events::GatewayEvent;
use parley_types::models::{ChatMessage, Identity, RoomKey, UserId};

use crate::error::GatewayError;
use crate::membership::RoomMembership;
use crate::notify::Notifier;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::relay::{OutboundMessage, Relay, RelayConfig};
use crate::store::MessageStore;

/// Manages all connected clients and routes events between them.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    registry: Arc<ConnectionRegistry>,
    membership: Arc<RoomMembership>,
    notifier: Arc<Notifier>,
    relay: Relay,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn MessageStore>, config: RelayConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let membership = Arc::new(RoomMembership::new());
        let notifier = Arc::new(Notifier::new(registry.clone()));
        let relay = Relay::new(
            store,
            registry.clone(),
            membership.clone(),
            notifier.clone(),
            config,
        );

        Self {
            inner: Arc::new(DispatcherInner {
                registry,
                membership,
                notifier,
                relay,
            }),
        }
    }

    /// Register a new connection for `identity`. Returns its id and the event stream
    /// to forward to the socket. Dropping the receiver stops delivery.
    pub async fn connect(
        &self,
        identity: Identity,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.registry.bind(identity, conn_id, tx).await;
        (conn_id, rx)
    }

    /// Release everything the connection held. Safe to call more than once.
    pub async fn disconnect(&self, conn_id: ConnectionId) -> Option<Identity> {
        let rooms = self.inner.membership.unsubscribe_all(conn_id).await;
        let identity = self.inner.registry.unbind(conn_id).await;
        if let Some(identity) = &identity {
            debug!(
                "{} disconnected ({}), left {} rooms",
                identity.user_id,
                conn_id,
                rooms.len()
            );
        }
        identity
    }

    /// Subscribe the connection to a room its identity participates in.
    pub async fn join_room(
        &self,
        conn_id: ConnectionId,
        room_key: &str,
    ) -> Result<RoomKey, GatewayError> {
        let identity = self.identity_of(conn_id).await?;
        let room_key = RoomKey::parse(room_key)?;
        if !room_key.includes(&identity.user_id) {
            return Err(GatewayError::Forbidden(room_key.to_string()));
        }

        if self.inner.membership.subscribe(conn_id, &room_key).await {
            info!("{} joined room {}", identity.user_id, room_key);
        }
        Ok(room_key)
    }

    pub async fn leave_room(
        &self,
        conn_id: ConnectionId,
        room_key: &str,
    ) -> Result<bool, GatewayError> {
        let room_key = RoomKey::parse(room_key)?;
        Ok(self.inner.membership.unsubscribe(conn_id, &room_key).await)
    }

    /// Persist and relay a chat message sent from `conn_id`.
    pub async fn send_chat(
        &self,
        conn_id: ConnectionId,
        draft: OutboundMessage,
    ) -> Result<ChatMessage, GatewayError> {
        self.inner.relay.send(conn_id, draft).await
    }

    /// Client-triggered notification. An offline recipient is not an error.
    pub async fn notify(
        &self,
        sender: &Identity,
        recipient_id: &str,
        excerpt: &str,
    ) -> Result<usize, GatewayError> {
        let recipient_id = UserId::new(recipient_id)?;
        Ok(self
            .inner
            .notifier
            .notify(&recipient_id, &sender.user_id, excerpt)
            .await)
    }

    pub async fn history(
        &self,
        requester: &Identity,
        room_key: &RoomKey,
    ) -> Result<Vec<ChatMessage>, GatewayError> {
        self.inner.relay.history(requester, room_key).await
    }

    pub async fn clear_room(
        &self,
        requester: &Identity,
        room_key: &RoomKey,
    ) -> Result<usize, GatewayError> {
        self.inner.relay.clear_room(requester, room_key).await
    }

    /// Send a targeted event to one connection.
    pub async fn send_to(&self, conn_id: ConnectionId, event: GatewayEvent) -> bool {
        self.inner.registry.send_to(conn_id, event).await
    }

    pub async fn connections_of(&self, user_id: &UserId) -> Vec<ConnectionId> {
        self.inner.registry.resolve(user_id).await
    }

    pub async fn is_connected(&self, conn_id: ConnectionId) -> bool {
        self.inner.registry.is_bound(conn_id).await
    }

    pub async fn subscriber_count(&self, room_key: &RoomKey) -> usize {
        self.inner.membership.subscribers_of(room_key).await.len()
    }

    async fn identity_of(&self, conn_id: ConnectionId) -> Result<Identity, GatewayError> {
        self.inner
            .registry
            .identity_of(conn_id)
            .await
            .ok_or_else(|| {
                GatewayError::Unauthenticated(format!("connection {conn_id} is not bound"))
            })
    }
}
