/// Database row types — these map directly to SQLite rows.
/// Distinct from parley-types models to keep the DB layer independent.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub seq: i64,
    pub id: String,
    pub room_key: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub sender_role: String,
    pub receiver_role: String,
    pub body: String,
    /// RFC 3339, UTC.
    pub sent_at: String,
}

/// Insert payload; `seq` is assigned by SQLite.
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub id: &'a str,
    pub room_key: &'a str,
    pub sender_id: &'a str,
    pub receiver_id: &'a str,
    pub sender_role: &'a str,
    pub receiver_role: &'a str,
    pub body: &'a str,
    pub sent_at: &'a str,
}
