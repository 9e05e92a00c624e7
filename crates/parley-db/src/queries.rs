use crate::models::{MessageRow, NewMessage};
use crate::Database;
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

const MESSAGE_COLUMNS: &str =
    "seq, id, room_key, sender_id, receiver_id, sender_role, receiver_role, body, sent_at";

impl Database {
    // -- Messages --

    /// Appends to the room's log. Returns the assigned sequence number, or `None`
    /// if a message with the same id is already stored.
    pub fn insert_message(&self, msg: &NewMessage<'_>) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO messages (id, room_key, sender_id, receiver_id, sender_role, receiver_role, body, sent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO NOTHING",
                rusqlite::params![
                    msg.id,
                    msg.room_key,
                    msg.sender_id,
                    msg.receiver_id,
                    msg.sender_role,
                    msg.receiver_role,
                    msg.body,
                    msg.sent_at,
                ],
            )?;
            if inserted == 0 {
                debug!("Message {} already stored", msg.id);
                return Ok(None);
            }
            Ok(Some(conn.last_insert_rowid()))
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                    [id],
                    map_row,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Whole log for a room, oldest first.
    pub fn get_room_messages(&self, room_key: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_room_messages(conn, room_key))
    }

    /// Deletes every message in the room. Returns how many rows went.
    pub fn delete_room_messages(&self, room_key: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM messages WHERE room_key = ?1", [room_key])?;
            debug!("Deleted {} messages from room {}", deleted, room_key);
            Ok(deleted)
        })
    }
}

fn query_room_messages(conn: &Connection, room_key: &str) -> Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_key = ?1 ORDER BY seq ASC"
    ))?;

    let rows = stmt
        .query_map([room_key], map_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        seq: row.get(0)?,
        id: row.get(1)?,
        room_key: row.get(2)?,
        sender_id: row.get(3)?,
        receiver_id: row.get(4)?,
        sender_role: row.get(5)?,
        receiver_role: row.get(6)?,
        body: row.get(7)?,
        sent_at: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_message<'a>(id: &'a str, room_key: &'a str, body: &'a str) -> NewMessage<'a> {
        NewMessage {
            id,
            room_key,
            sender_id: "A",
            receiver_id: "B",
            sender_role: "initiator",
            receiver_role: "responder",
            body,
            sent_at: "2026-10-16T09:00:00Z",
        }
    }

    #[test]
    fn test_history_is_ordered_and_room_scoped() {
        let db = Database::open_in_memory().unwrap();
        db.insert_message(&new_message("m1", "A_B", "hello")).unwrap();
        db.insert_message(&new_message("m2", "A_C", "elsewhere")).unwrap();
        db.insert_message(&new_message("m3", "A_B", "urgent")).unwrap();

        let rows = db.get_room_messages("A_B").unwrap();
        let bodies: Vec<_> = rows.iter().map(|r| r.body.as_str()).collect();
        assert_eq!(bodies, vec!["hello", "urgent"]);
        assert!(rows[0].seq < rows[1].seq);
    }

    #[test]
    fn test_delete_room_clears_only_that_room() {
        let db = Database::open_in_memory().unwrap();
        db.insert_message(&new_message("m1", "A_B", "hello")).unwrap();
        db.insert_message(&new_message("m2", "A_C", "keep me")).unwrap();

        assert_eq!(db.delete_room_messages("A_B").unwrap(), 1);
        assert!(db.get_room_messages("A_B").unwrap().is_empty());
        assert_eq!(db.get_room_messages("A_C").unwrap().len(), 1);

        // Empty room is not an error
        assert_eq!(db.delete_room_messages("A_B").unwrap(), 0);
    }

    #[test]
    fn test_duplicate_id_is_ignored() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.insert_message(&new_message("m1", "A_B", "hello")).unwrap().is_some());
        assert!(db.insert_message(&new_message("m1", "A_B", "again")).unwrap().is_none());

        let rows = db.get_room_messages("A_B").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].body, "hello");

        assert_eq!(db.get_message("m1").unwrap().unwrap().body, "hello");
        assert!(db.get_message("missing").unwrap().is_none());
    }
}
