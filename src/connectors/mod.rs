use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::AuthError;
use crate::retry::IsRetryable;

pub mod gmail_api;
pub mod json_archive;

pub use gmail_api::{
    GmailApiConnector, GmailBody, GmailHeader, GmailMessage, GmailPayload, GMAIL_API_BASE,
};
pub use json_archive::JsonArchiveSource;

const REDACTED_BODY_MAX_LEN: usize = 200;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("http client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("request to {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{operation} failed: status={status} body={body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("decode {what}: {source}")]
    Decode {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("message not found: {0}")]
    NotFound(String),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl IsRetryable for ConnectorError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Lightweight reference returned by a listing call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHandle {
    pub id: String,
    #[serde(rename = "threadId", default)]
    pub thread_id: String,
}

/// One page of a listing. An empty `next_page_token` means there are no more pages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePage {
    pub handles: Vec<MessageHandle>,
    pub next_page_token: String,
}

impl MessagePage {
    pub fn is_last(&self) -> bool {
        self.next_page_token.is_empty()
    }
}

/// A remote mailbox that can be listed page by page and read message by message.
///
/// Implementations are shared across producer tasks, so they must be
/// `Send + Sync` and their futures `Send`.
#[async_trait]
pub trait MessageSource: Send + Sync {
    fn name(&self) -> &str;

    /// Lists one page. `page_token` is empty for the first page.
    async fn list_page(
        &self,
        query: &str,
        page_size: u32,
        page_token: &str,
    ) -> Result<MessagePage, ConnectorError>;

    /// Fetches the fully expanded message.
    async fn fetch_message(&self, id: &str) -> Result<GmailMessage, ConnectorError>;
}

pub(crate) fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        return trimmed.to_string();
    }

    let mut cut = REDACTED_BODY_MAX_LEN;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…[truncated {} bytes]", &trimmed[..cut], trimmed.len())
}
