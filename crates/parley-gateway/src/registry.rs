use std::collections::{HashMap, HashSet};
use std::fmt;

use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use parley_types::events::GatewayEvent;
use parley_types::models::{Identity, UserId};

/// Unique identifier for one live WebSocket connection.
///
/// A user with two tabs open has two of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

struct Binding {
    identity: Identity,
    sender: mpsc::UnboundedSender<GatewayEvent>,
}

#[derive(Default)]
struct RegistryState {
    by_conn: HashMap<ConnectionId, Binding>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
}

impl RegistryState {
    fn detach(&mut self, conn_id: ConnectionId) -> Option<Binding> {
        let binding = self.by_conn.remove(&conn_id)?;
        if let Some(conns) = self.by_user.get_mut(&binding.identity.user_id) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                self.by_user.remove(&binding.identity.user_id);
            }
        }
        Some(binding)
    }
}

/// Which identity owns which live connection(s).
///
/// Set-valued: every device a user has connected stays reachable.
#[derive(Default)]
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `conn_id` to `identity`. Re-binding a connection moves it to the new identity.
    pub async fn bind(
        &self,
        identity: Identity,
        conn_id: ConnectionId,
        sender: mpsc::UnboundedSender<GatewayEvent>,
    ) {
        let mut state = self.state.write().await;

        if let Some(previous) = state.detach(conn_id) {
            debug!(
                "Connection {} re-bound from {} to {}",
                conn_id, previous.identity.user_id, identity.user_id
            );
        }

        state
            .by_user
            .entry(identity.user_id.clone())
            .or_default()
            .insert(conn_id);
        state.by_conn.insert(conn_id, Binding { identity, sender });

        debug!(
            "Bound connection {}, {} connections live",
            conn_id,
            state.by_conn.len()
        );
    }

    /// Forget the connection. Called on disconnect. Returns the identity it was bound to.
    pub async fn unbind(&self, conn_id: ConnectionId) -> Option<Identity> {
        let binding = self.state.write().await.detach(conn_id)?;
        debug!("Unbound connection {} ({})", conn_id, binding.identity.user_id);
        Some(binding.identity)
    }

    /// All live connections for a user. Empty when the user is offline.
    pub async fn resolve(&self, user_id: &UserId) -> Vec<ConnectionId> {
        self.state
            .read()
            .await
            .by_user
            .get(user_id)
            .map(|conns| conns.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn identity_of(&self, conn_id: ConnectionId) -> Option<Identity> {
        self.state
            .read()
            .await
            .by_conn
            .get(&conn_id)
            .map(|b| b.identity.clone())
    }

    pub async fn is_bound(&self, conn_id: ConnectionId) -> bool {
        self.state.read().await.by_conn.contains_key(&conn_id)
    }

    /// Queue `event` on one connection. Returns false if it is gone.
    pub async fn send_to(&self, conn_id: ConnectionId, event: GatewayEvent) -> bool {
        let state = self.state.read().await;
        match state.by_conn.get(&conn_id) {
            Some(binding) => binding.sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Queue `event` on each listed connection that is still bound.
    /// Returns how many accepted it.
    pub async fn send_to_each(&self, conn_ids: &[ConnectionId], event: &GatewayEvent) -> usize {
        let state = self.state.read().await;
        conn_ids
            .iter()
            .filter_map(|id| state.by_conn.get(id))
            .filter(|binding| binding.sender.send(event.clone()).is_ok())
            .count()
    }

    /// Queue `event` on every connection the user has. Returns how many accepted it.
    pub async fn send_to_user(&self, user_id: &UserId, event: &GatewayEvent) -> usize {
        let state = self.state.read().await;
        let Some(conns) = state.by_user.get(user_id) else {
            return 0;
        };
        conns
            .iter()
            .filter_map(|id| state.by_conn.get(id))
            .filter(|binding| binding.sender.send(event.clone()).is_ok())
            .count()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.by_conn.len()
    }
}
