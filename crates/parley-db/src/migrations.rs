use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    // `seq` is the persistence order; history is always read back by it.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS messages (
            seq             INTEGER PRIMARY KEY AUTOINCREMENT,
            id              TEXT NOT NULL UNIQUE,
            room_key        TEXT NOT NULL,
            sender_id       TEXT NOT NULL,
            receiver_id     TEXT NOT NULL,
            sender_role     TEXT NOT NULL,
            receiver_role   TEXT NOT NULL,
            body            TEXT NOT NULL,
            sent_at         TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_room
            ON messages(room_key, seq);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
