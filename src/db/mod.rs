use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

use self::models::{StoredMessage, SyncState, URL_SEPARATOR};
use crate::config;
use crate::extract::ExtractedRecord;

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Config(String),
}

pub mod migrations;
pub mod models;
pub mod schema;

pub const LAST_SYNC_KEY: &str = "last_sync_completed_at";

/// What an upsert did to the row keyed by the record id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The stored row was at least as new as the incoming record.
    Unchanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_messages: i64,
    pub messages_with_urls: i64,
    pub newest_received_at: Option<i64>,
    pub last_sync: Option<String>,
}

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let mut db = Self {
            conn,
            path: path.to_path_buf(),
        };
        db.initialize()?;
        Ok(db)
    }

    pub fn initialize(&mut self) -> Result<(), DbError> {
        self.run_migrations()
    }

    fn run_migrations(&mut self) -> Result<(), DbError> {
        migrations::migrate(&self.conn)
            .map_err(|e| DbError::Config(format!("migration failed: {e}")))
    }

    pub fn default_db_path() -> Result<PathBuf, DbError> {
        let app_dir = config::app_dir().map_err(|e| DbError::Config(e.to_string()))?;
        Ok(app_dir.join(config::DATABASE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inserts the record, or overwrites the stored row only when the incoming
    /// `received_at_ms` is strictly newer than the stored one.
    pub fn upsert_message(&self, record: &ExtractedRecord) -> Result<UpsertOutcome, DbError> {
        let urls = record.urls.join(URL_SEPARATOR);
        let tx = self.conn.unchecked_transaction()?;

        let existed = tx
            .query_row(
                "SELECT 1 FROM messages WHERE message_id = ? LIMIT 1",
                [record.id.as_str()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        let changed = tx.execute(
            r#"
            INSERT INTO messages (message_id, from_address, subject, body, urls, received_at, stored_at)
            VALUES (?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            ON CONFLICT(message_id) DO UPDATE SET
                from_address = excluded.from_address,
                subject = excluded.subject,
                body = excluded.body,
                urls = excluded.urls,
                received_at = excluded.received_at,
                stored_at = excluded.stored_at
            WHERE excluded.received_at > messages.received_at
            "#,
            params![
                record.id,
                record.from,
                record.subject,
                record.body,
                urls,
                record.received_at_ms,
            ],
        )?;
        tx.commit()?;

        Ok(match (existed, changed) {
            (false, _) => UpsertOutcome::Inserted,
            (true, 0) => UpsertOutcome::Unchanged,
            (true, _) => UpsertOutcome::Updated,
        })
    }

    pub fn get_message(&self, message_id: &str) -> Result<Option<StoredMessage>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT message_id, from_address, subject, body, urls, received_at, stored_at
            FROM messages
            WHERE message_id = ?
            LIMIT 1
            "#,
        )?;

        let mut rows = stmt.query([message_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(StoredMessage::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn list_messages(&self, limit: usize) -> Result<Vec<StoredMessage>, DbError> {
        let limit = if limit == 0 { 50 } else { limit };
        let mut stmt = self.conn.prepare(
            r#"
            SELECT message_id, from_address, subject, body, urls, received_at, stored_at
            FROM messages
            ORDER BY received_at DESC
            LIMIT ?
            "#,
        )?;

        let messages = stmt
            .query_map([limit as i64], StoredMessage::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    pub fn get_sync_state(&self, key: &str) -> Result<Option<SyncState>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value, updated_at FROM sync_state WHERE key = ? LIMIT 1")?;
        let mut rows = stmt.query([key])?;
        if let Some(row) = rows.next()? {
            Ok(Some(SyncState::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn set_sync_state(&self, key: &str, value: &str) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            INSERT INTO sync_state (key, value, updated_at)
            VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_stats(&self) -> Result<DatabaseStats, DbError> {
        let total_messages: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        let messages_with_urls: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE urls IS NOT NULL AND urls != ''",
            [],
            |row| row.get(0),
        )?;
        let newest_received_at: Option<i64> =
            self.conn
                .query_row("SELECT MAX(received_at) FROM messages", [], |row| row.get(0))?;
        let last_sync = self
            .get_sync_state(LAST_SYNC_KEY)?
            .and_then(|state| state.value);

        Ok(DatabaseStats {
            total_messages,
            messages_with_urls,
            newest_received_at,
            last_sync,
        })
    }
}
