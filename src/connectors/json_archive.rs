use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::connectors::{
    ConnectorError, GmailMessage, MessageHandle, MessagePage, MessageSource,
};

/// Replays Gmail messages saved as JSON (one message or an array of messages
/// per `.json` file). Pages are cut in file order; the query is not evaluated.
#[derive(Debug, Default, Clone)]
pub struct JsonArchiveSource {
    messages: Vec<GmailMessage>,
    by_id: HashMap<String, usize>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ArchiveFile {
    Many(Vec<GmailMessage>),
    One(Box<GmailMessage>),
}

impl JsonArchiveSource {
    pub fn open(path: &Path) -> Result<Self, ConnectorError> {
        let mut messages = Vec::new();
        for file_path in collect_json_files(path)? {
            let raw = std::fs::read_to_string(&file_path)?;
            let parsed: ArchiveFile =
                serde_json::from_str(&raw).map_err(|source| ConnectorError::Decode {
                    what: format!("archive file {}", file_path.display()),
                    source,
                })?;
            match parsed {
                ArchiveFile::Many(batch) => messages.extend(batch),
                ArchiveFile::One(message) => messages.push(*message),
            }
        }

        debug!(path = %path.display(), messages = messages.len(), "loaded json archive");
        Ok(Self::from_messages(messages))
    }

    /// A repeated id keeps its first listing position and its last content.
    pub fn from_messages(messages: impl IntoIterator<Item = GmailMessage>) -> Self {
        let mut source = Self::default();
        for message in messages {
            match source.by_id.get(&message.id) {
                Some(&index) => source.messages[index] = message,
                None => {
                    source.by_id.insert(message.id.clone(), source.messages.len());
                    source.messages.push(message);
                }
            }
        }
        source
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[async_trait]
impl MessageSource for JsonArchiveSource {
    fn name(&self) -> &str {
        "json_archive"
    }

    async fn list_page(
        &self,
        query: &str,
        page_size: u32,
        page_token: &str,
    ) -> Result<MessagePage, ConnectorError> {
        if !query.is_empty() {
            debug!(query, "json archive lists every message regardless of query");
        }

        let offset = if page_token.is_empty() {
            0
        } else {
            page_token
                .parse::<usize>()
                .map_err(|_| ConnectorError::Other(format!("invalid page token: {page_token}")))?
        };
        let page_size = (page_size as usize).max(1);
        let end = offset.saturating_add(page_size).min(self.messages.len());

        let handles = self
            .messages
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|message| MessageHandle {
                id: message.id.clone(),
                thread_id: message.thread_id.clone(),
            })
            .collect();
        let next_page_token = if end < self.messages.len() {
            end.to_string()
        } else {
            String::new()
        };

        Ok(MessagePage {
            handles,
            next_page_token,
        })
    }

    async fn fetch_message(&self, id: &str) -> Result<GmailMessage, ConnectorError> {
        self.by_id
            .get(id)
            .map(|&index| self.messages[index].clone())
            .ok_or_else(|| ConnectorError::NotFound(id.to_string()))
    }
}

fn collect_json_files(path: &Path) -> Result<Vec<PathBuf>, ConnectorError> {
    let is_json = |candidate: &Path| candidate.extension().and_then(|ext| ext.to_str()) == Some("json");

    if path.is_file() {
        if is_json(path) {
            return Ok(vec![path.to_path_buf()]);
        }
        return Err(ConnectorError::Other(format!(
            "expected .json file, got {}",
            path.display()
        )));
    }

    if !path.is_dir() {
        return Err(ConnectorError::Other(format!(
            "archive path does not exist or is not a file/directory: {}",
            path.display()
        )));
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry_path = entry?.path();
        if entry_path.is_file() && is_json(&entry_path) {
            files.push(entry_path);
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use uuid::Uuid;

    use super::JsonArchiveSource;
    use crate::connectors::{ConnectorError, GmailMessage, MessageSource};

    fn temp_root() -> PathBuf {
        let root = std::env::temp_dir().join(format!("recipe-sync-archive-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root).expect("create archive dir");
        root
    }

    fn message(id: &str) -> GmailMessage {
        GmailMessage {
            id: id.to_string(),
            thread_id: format!("thread-{id}"),
            ..GmailMessage::default()
        }
    }

    #[tokio::test]
    async fn pages_follow_listing_order_until_empty_token() {
        let source = JsonArchiveSource::from_messages((1..=5).map(|n| message(&format!("m{n}"))));

        let first = source.list_page("label:Recipes", 2, "").await.expect("page 1");
        assert_eq!(first.next_page_token, "2");
        let second = source.list_page("", 2, &first.next_page_token).await.expect("page 2");
        let third = source.list_page("", 2, &second.next_page_token).await.expect("page 3");

        let ids: Vec<_> = [first, second, third.clone()]
            .iter()
            .flat_map(|page| page.handles.iter().map(|h| h.id.clone()))
            .collect();
        assert_eq!(ids, vec!["m1", "m2", "m3", "m4", "m5"]);
        assert!(third.is_last());
    }

    #[tokio::test]
    async fn empty_archive_yields_single_empty_page() {
        let source = JsonArchiveSource::default();
        let page = source.list_page("", 25, "").await.expect("page");
        assert!(page.handles.is_empty());
        assert!(page.is_last());
    }

    #[tokio::test]
    async fn unknown_id_and_bad_token_are_errors() {
        let source = JsonArchiveSource::from_messages([message("m1")]);
        assert!(matches!(
            source.fetch_message("nope").await,
            Err(ConnectorError::NotFound(id)) if id == "nope"
        ));
        assert!(source.list_page("", 1, "not-a-number").await.is_err());
    }

    #[tokio::test]
    async fn open_reads_single_and_array_files() {
        let root = temp_root();
        std::fs::write(
            root.join("a.json"),
            r#"{"id": "single", "threadId": "t", "internalDate": "5", "payload": {}}"#,
        )
        .expect("write single");
        std::fs::write(
            root.join("b.json"),
            r#"[{"id": "first"}, {"id": "second"}]"#,
        )
        .expect("write array");
        std::fs::write(root.join("notes.txt"), "ignored").expect("write other");

        let source = JsonArchiveSource::open(&root).expect("open archive");
        assert_eq!(source.len(), 3);

        let page = source.list_page("", 10, "").await.expect("page");
        let ids: Vec<_> = page.handles.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["single", "first", "second"]);

        let fetched = source.fetch_message("single").await.expect("fetch");
        assert_eq!(fetched.internal_date.as_deref(), Some("5"));
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn repeated_ids_collapse_to_last_content() {
        let newer = GmailMessage {
            snippet: Some("newer".to_string()),
            ..message("dup")
        };
        let source = JsonArchiveSource::from_messages([message("dup"), message("x"), newer]);
        assert_eq!(source.len(), 2);
        assert_eq!(source.messages[0].snippet.as_deref(), Some("newer"));
    }
}
