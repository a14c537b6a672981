use rusqlite::Connection;

/// v1: one row per Gmail message, keyed by its API id.
pub fn create_messages_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            row_id INTEGER PRIMARY KEY,
            message_id TEXT NOT NULL UNIQUE,
            from_address TEXT,
            subject TEXT,
            body TEXT,
            urls TEXT,
            received_at INTEGER NOT NULL DEFAULT 0,
            stored_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );
        "#,
    )
}

/// v2: `recent` sorts on `received_at`; `stats` filters on `urls`.
pub fn create_message_indexes(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE INDEX IF NOT EXISTS idx_messages_received_at ON messages(received_at DESC);
        CREATE INDEX IF NOT EXISTS idx_messages_with_urls ON messages(message_id) WHERE urls <> '';
        "#,
    )
}
