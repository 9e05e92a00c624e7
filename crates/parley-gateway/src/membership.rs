use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;
use tracing::debug;

use parley_types::events::GatewayEvent;
use parley_types::models::RoomKey;

use crate::registry::{ConnectionId, ConnectionRegistry};

#[derive(Default)]
struct MembershipState {
    // room -> subscribed connections
    rooms: HashMap<RoomKey, HashSet<ConnectionId>>,
    // connection -> rooms, for disconnect cleanup
    by_conn: HashMap<ConnectionId, HashSet<RoomKey>>,
}

/// Which connections are currently looking at which rooms.
#[derive(Default)]
pub struct RoomMembership {
    state: RwLock<MembershipState>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent. Returns true if the connection was not already subscribed.
    pub async fn subscribe(&self, conn_id: ConnectionId, room_key: &RoomKey) -> bool {
        let mut state = self.state.write().await;
        let added = state
            .rooms
            .entry(room_key.clone())
            .or_default()
            .insert(conn_id);
        state
            .by_conn
            .entry(conn_id)
            .or_default()
            .insert(room_key.clone());

        if added {
            debug!(
                "Connection {} joined room {}, {} subscribers",
                conn_id,
                room_key,
                state.rooms.get(room_key).map(|s| s.len()).unwrap_or(0)
            );
        }
        added
    }

    /// Returns true if the connection was subscribed.
    pub async fn unsubscribe(&self, conn_id: ConnectionId, room_key: &RoomKey) -> bool {
        let mut state = self.state.write().await;
        let removed = remove_subscriber(&mut state.rooms, room_key, conn_id);
        if let Some(rooms) = state.by_conn.get_mut(&conn_id) {
            rooms.remove(room_key);
            if rooms.is_empty() {
                state.by_conn.remove(&conn_id);
            }
        }
        if removed {
            debug!("Connection {} left room {}", conn_id, room_key);
        }
        removed
    }

    /// Drop every subscription the connection holds. Returns the rooms it was in.
    pub async fn unsubscribe_all(&self, conn_id: ConnectionId) -> Vec<RoomKey> {
        let mut state = self.state.write().await;
        let Some(rooms) = state.by_conn.remove(&conn_id) else {
            return Vec::new();
        };
        for room_key in &rooms {
            remove_subscriber(&mut state.rooms, room_key, conn_id);
        }
        debug!("Connection {} released {} rooms", conn_id, rooms.len());
        rooms.into_iter().collect()
    }

    pub async fn subscribers_of(&self, room_key: &RoomKey) -> HashSet<ConnectionId> {
        self.state
            .read()
            .await
            .rooms
            .get(room_key)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn is_subscribed(&self, conn_id: ConnectionId, room_key: &RoomKey) -> bool {
        self.state
            .read()
            .await
            .rooms
            .get(room_key)
            .is_some_and(|subs| subs.contains(&conn_id))
    }

    /// Deliver `event` to every subscriber of the room except `except`.
    ///
    /// The membership read lock is held for the whole delivery, so a connection
    /// being torn down is either fully in the snapshot or fully out of it.
    /// Returns how many connections accepted the event.
    pub async fn fan_out(
        &self,
        registry: &ConnectionRegistry,
        room_key: &RoomKey,
        except: Option<ConnectionId>,
        event: &GatewayEvent,
    ) -> usize {
        let state = self.state.read().await;
        let Some(subs) = state.rooms.get(room_key) else {
            return 0;
        };
        let targets: Vec<ConnectionId> = subs
            .iter()
            .copied()
            .filter(|id| Some(*id) != except)
            .collect();
        registry.send_to_each(&targets, event).await
    }
}

fn remove_subscriber(
    rooms: &mut HashMap<RoomKey, HashSet<ConnectionId>>,
    room_key: &RoomKey,
    conn_id: ConnectionId,
) -> bool {
    let Some(subs) = rooms.get_mut(room_key) else {
        return false;
    };
    let removed = subs.remove(&conn_id);
    // Rooms are implicit; an empty one leaves no trace
    if subs.is_empty() {
        rooms.remove(room_key);
    }
    removed
}
