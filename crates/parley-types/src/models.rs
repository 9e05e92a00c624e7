use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Separator between the two participant ids inside a room key.
pub const ROOM_KEY_SEPARATOR: char = '_';

pub const MAX_USER_ID_LEN: usize = 64;

/// Notification excerpts are cut to this many characters.
pub const EXCERPT_LEN: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomKeyError {
    #[error("user id is empty")]
    EmptyUserId,

    #[error("user id exceeds {MAX_USER_ID_LEN} characters")]
    UserIdTooLong,

    #[error("user id contains a reserved character: {0:?}")]
    ReservedCharacter(char),

    #[error("room key must join exactly two participant ids with '_'")]
    Malformed,

    #[error("room key names the same participant twice")]
    SameParticipant,
}

/// Opaque user identifier issued by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn new(raw: impl Into<String>) -> Result<Self, RoomKeyError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(RoomKeyError::EmptyUserId);
        }
        if raw.chars().count() > MAX_USER_ID_LEN {
            return Err(RoomKeyError::UserIdTooLong);
        }
        if let Some(c) = raw
            .chars()
            .find(|c| *c == ROOM_KEY_SEPARATOR || c.is_whitespace())
        {
            return Err(RoomKeyError::ReservedCharacter(c));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = RoomKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl FromStr for UserId {
    type Err = RoomKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of a two-party conversation an identity plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn counterpart(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initiator => "initiator",
            Self::Responder => "responder",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiator" => Ok(Self::Initiator),
            "responder" => Ok(Self::Responder),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A verified user: established at login, held for the session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub role: Role,
}

impl Identity {
    pub fn new(user_id: UserId, role: Role) -> Self {
        Self { user_id, role }
    }
}

/// Conversation scope derived from the two participants.
///
/// Rooms are never created or destroyed: a key is a pure function of the pair
/// and exists as soon as anyone subscribes to it or a message references it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomKey {
    raw: String,
    split: usize,
}

impl RoomKey {
    /// Canonical key for a conversation. The pair is unordered: the
    /// lexicographically smaller id always comes first.
    pub fn between(a: &UserId, b: &UserId) -> Result<Self, RoomKeyError> {
        let (first, second) = match a.cmp(b) {
            Ordering::Less => (a, b),
            Ordering::Greater => (b, a),
            Ordering::Equal => return Err(RoomKeyError::SameParticipant),
        };
        Ok(Self {
            raw: format!("{first}{ROOM_KEY_SEPARATOR}{second}"),
            split: first.as_str().len(),
        })
    }

    /// Key for the conversation between `me` and `partner`.
    pub fn for_pair(me: &Identity, partner: &UserId) -> Result<Self, RoomKeyError> {
        Self::between(&me.user_id, partner)
    }

    /// Accepts the two ids in either order and returns the canonical key.
    pub fn parse(raw: &str) -> Result<Self, RoomKeyError> {
        let mut parts = raw.split(ROOM_KEY_SEPARATOR);
        let (Some(first), Some(second), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(RoomKeyError::Malformed);
        };
        let first = UserId::new(first)?;
        let second = UserId::new(second)?;
        Self::between(&first, &second)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn participants(&self) -> (UserId, UserId) {
        // Both halves were validated at construction.
        (
            UserId(self.raw[..self.split].to_string()),
            UserId(self.raw[self.split + 1..].to_string()),
        )
    }

    pub fn includes(&self, user_id: &UserId) -> bool {
        let (a, b) = self.participants();
        a == *user_id || b == *user_id
    }

    /// The participant that is not `user_id`, if `user_id` is in the room.
    pub fn other(&self, user_id: &UserId) -> Option<UserId> {
        let (a, b) = self.participants();
        if a == *user_id {
            Some(b)
        } else if b == *user_id {
            Some(a)
        } else {
            None
        }
    }
}

impl TryFrom<String> for RoomKey {
    type Error = RoomKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoomKey> for String {
    fn from(value: RoomKey) -> Self {
        value.raw
    }
}

impl FromStr for RoomKey {
    type Err = RoomKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A chat message as it sits in the durable log. Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_key: RoomKey,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub sender_role: Role,
    pub receiver_role: Role,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// Ephemeral "you have a new message" event. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient_id: UserId,
    pub sender_id: UserId,
    pub excerpt: String,
    pub sent_at: DateTime<Utc>,
}

/// Truncates `body` to at most `EXCERPT_LEN` characters, the trailing `…` included.
pub fn excerpt(body: &str) -> String {
    if body.chars().count() <= EXCERPT_LEN {
        return body.to_string();
    }
    match body.char_indices().nth(EXCERPT_LEN - 1) {
        Some((idx, _)) => format!("{}…", &body[..idx]),
        None => body.to_string(),
    }
}
