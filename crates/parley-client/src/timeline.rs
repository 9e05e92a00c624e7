use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use parley_types::events::GatewayEvent;
use parley_types::models::{ChatMessage, RoomKey, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Rendered at submit time, not yet acknowledged by the server.
    Pending,
    /// Known to be in the durable log.
    Confirmed,
}

/// One rendered line of a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Persisted id. `None` until the server acknowledges a local send.
    pub id: Option<Uuid>,
    pub nonce: Option<String>,
    pub sender_id: UserId,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub state: EntryState,
}

impl Entry {
    pub fn pending(nonce: String, sender_id: UserId, body: String, at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            nonce: Some(nonce),
            sender_id,
            body,
            sent_at: at,
            state: EntryState::Pending,
        }
    }

    pub fn confirmed(message: &ChatMessage) -> Self {
        Self {
            id: Some(message.id),
            nonce: None,
            sender_id: message.sender_id.clone(),
            body: message.body.clone(),
            sent_at: message.sent_at,
            state: EntryState::Confirmed,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == EntryState::Pending
    }

    /// Same persisted message: by id, or by (sender, timestamp, body).
    fn is_same_as(&self, message: &ChatMessage) -> bool {
        if self.id == Some(message.id) {
            return true;
        }
        self.state == EntryState::Confirmed
            && self.sender_id == message.sender_id
            && self.sent_at == message.sent_at
            && self.body == message.body
    }
}

/// Duplicate-free view of one room.
///
/// History fetches and live events race when a room is opened; every input is
/// merged idempotently, so any interleaving of the two ends in the same view.
/// Confirmed entries are kept in `sent_at` order with pending local sends after them.
#[derive(Debug, Clone)]
pub struct Timeline {
    room_key: RoomKey,
    me: UserId,
    entries: Vec<Entry>,
}

impl Timeline {
    pub fn new(room_key: RoomKey, me: UserId) -> Self {
        Self {
            room_key,
            me,
            entries: Vec::new(),
        }
    }

    pub fn room_key(&self) -> &RoomKey {
        &self.room_key
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Optimistically render one of our own sends.
    pub fn push_local(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    /// Merge a fetched history snapshot. Returns how many entries were new.
    pub fn merge_history(&mut self, history: &[ChatMessage]) -> usize {
        let added = history.iter().filter(|m| self.absorb(m)).count();
        debug!(
            "Merged history for {}: {} of {} messages new",
            self.room_key,
            added,
            history.len()
        );
        added
    }

    /// A live `ChatMessage` event. Returns false if it was already shown.
    pub fn apply_live(&mut self, message: &ChatMessage) -> bool {
        self.absorb(message)
    }

    /// The server acknowledged one of our sends.
    pub fn confirm(&mut self, nonce: Option<&str>, message: &ChatMessage) -> bool {
        if message.room_key != self.room_key {
            return false;
        }

        let local = nonce.and_then(|nonce| {
            self.entries
                .iter()
                .position(|e| e.is_pending() && e.nonce.as_deref() == Some(nonce))
        });
        let Some(idx) = local else {
            return self.absorb(message);
        };

        self.entries.remove(idx);
        if self.entries.iter().any(|e| e.is_same_as(message)) {
            // History got there first
            return true;
        }
        self.insert_confirmed(Entry::confirmed(message));
        true
    }

    /// Drop a pending send, e.g. after the server rejected it.
    pub fn retract(&mut self, nonce: &str) -> Option<Entry> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.is_pending() && e.nonce.as_deref() == Some(nonce))?;
        Some(self.entries.remove(idx))
    }

    /// The room's log was wiped. Local sends still in flight are kept.
    pub fn clear(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(Entry::is_pending);
        before - self.entries.len()
    }

    /// Feed any gateway event through the timeline. Returns whether the view changed.
    pub fn apply_event(&mut self, event: &GatewayEvent) -> bool {
        match event {
            GatewayEvent::ChatMessage(message) => self.apply_live(message),
            GatewayEvent::MessageSent { nonce, message } => self.confirm(nonce.as_deref(), message),
            GatewayEvent::RoomCleared { room_key, .. } if *room_key == self.room_key => {
                self.clear() > 0
            }
            _ => false,
        }
    }

    fn absorb(&mut self, message: &ChatMessage) -> bool {
        if message.room_key != self.room_key {
            return false;
        }
        if self.entries.iter().any(|e| e.is_same_as(message)) {
            return false;
        }

        // Our own message seen before its acknowledgement.
        if message.sender_id == self.me {
            if let Some(idx) = self
                .entries
                .iter()
                .position(|e| e.is_pending() && e.body == message.body)
            {
                self.entries.remove(idx);
            }
        }

        self.insert_confirmed(Entry::confirmed(message));
        true
    }

    fn insert_confirmed(&mut self, entry: Entry) {
        let idx = self
            .entries
            .partition_point(|e| !e.is_pending() && e.sent_at <= entry.sent_at);
        self.entries.insert(idx, entry);
    }
}
