use rusqlite::{Result as SqlResult, Row};
use serde::{Deserialize, Serialize};

/// Separator used when a record's URL list is flattened into one column.
pub const URL_SEPARATOR: &str = ", ";

/// One row of the `messages` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredMessage {
    pub message_id: String,
    pub from_address: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub urls: Option<String>,
    pub received_at: i64,
    pub stored_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncState {
    pub key: String,
    pub value: Option<String>,
    pub updated_at: Option<String>,
}

impl StoredMessage {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            message_id: row.get("message_id")?,
            from_address: row.get("from_address")?,
            subject: row.get("subject")?,
            body: row.get("body")?,
            urls: row.get("urls")?,
            received_at: row.get("received_at")?,
            stored_at: row.get("stored_at")?,
        })
    }

    /// Splits the stored URL column back into individual links.
    pub fn url_list(&self) -> Vec<String> {
        self.urls
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
            .map(|raw| raw.split(URL_SEPARATOR).map(str::to_string).collect())
            .unwrap_or_default()
    }
}

impl SyncState {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            key: row.get("key")?,
            value: row.get("value")?,
            updated_at: row.get("updated_at")?,
        })
    }
}
