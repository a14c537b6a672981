use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::auth::{self, AccessToken, GmailCredentials};
use crate::config::{self, ENV_API_URL};
use crate::connectors::{
    redact_response_body, ConnectorError, MessageHandle, MessagePage, MessageSource,
};

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const MAX_RATE_LIMIT_RETRIES: usize = 5;
const MAX_BACKOFF_SECONDS: u64 = 32;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Reads messages through the Gmail REST API with a refreshed bearer token.
pub struct GmailApiConnector {
    client: Client,
    api_base: String,
    credentials: GmailCredentials,
    token: Mutex<Option<AccessToken>>,
}

impl GmailApiConnector {
    pub fn new(credentials: GmailCredentials) -> Result<Self, ConnectorError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        let api_base = config::env_non_empty(ENV_API_URL).unwrap_or_else(|| GMAIL_API_BASE.to_string());

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            credentials,
            token: Mutex::new(None),
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Returns the cached token or mints a new one. Concurrent callers queue on
    /// the mutex so only one refresh is in flight.
    async fn access_token(&self) -> Result<String, ConnectorError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|token| !token.is_expired()) {
            return Ok(token.access_token.clone());
        }

        let fresh = auth::refresh_access_token(&self.client, &self.credentials).await?;
        let value = fresh.access_token.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    async fn invalidate_token(&self, rejected: &str) {
        let mut cached = self.token.lock().await;
        if cached
            .as_ref()
            .is_some_and(|token| token.access_token == rejected)
        {
            *cached = None;
        }
    }

    /// GET with 429 / Retry-After handling and one token refresh on 401.
    async fn fetch_with_retry(
        &self,
        operation: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<String, ConnectorError> {
        let mut backoff_seconds = 1u64;
        let mut refreshed = false;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let token = self.access_token().await?;
            let response = self
                .client
                .get(url)
                .query(query)
                .bearer_auth(&token)
                .header("accept", "application/json")
                .send()
                .await
                .map_err(|source| ConnectorError::Transport {
                    url: url.to_string(),
                    source,
                })?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS && attempt < MAX_RATE_LIMIT_RETRIES {
                let retry_after_seconds = response
                    .headers()
                    .get("retry-after")
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(backoff_seconds);
                warn!(operation, retry_after_seconds, "gmail api throttled");
                sleep(Duration::from_secs(retry_after_seconds)).await;
                backoff_seconds = (backoff_seconds * 2).min(MAX_BACKOFF_SECONDS);
                continue;
            }

            if status == StatusCode::UNAUTHORIZED && !refreshed {
                debug!(operation, "gmail api rejected access token, refreshing");
                self.invalidate_token(&token).await;
                refreshed = true;
                continue;
            }

            let body = response
                .text()
                .await
                .map_err(|source| ConnectorError::Transport {
                    url: url.to_string(),
                    source,
                })?;
            if status.is_success() {
                return Ok(body);
            }

            let body = redact_response_body(&body);
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    ConnectorError::Auth(auth::AuthError::Rejected {
                        status: status.as_u16(),
                        body,
                    })
                }
                _ => ConnectorError::Status {
                    operation: operation.to_string(),
                    status: status.as_u16(),
                    body,
                },
            });
        }

        Err(ConnectorError::Other(format!(
            "gmail {operation} failed without response"
        )))
    }
}

#[async_trait]
impl MessageSource for GmailApiConnector {
    fn name(&self) -> &str {
        "gmail_api"
    }

    async fn list_page(
        &self,
        query: &str,
        page_size: u32,
        page_token: &str,
    ) -> Result<MessagePage, ConnectorError> {
        let url = format!("{}/users/me/messages", self.api_base);
        let mut params = vec![("maxResults", page_size.to_string())];
        if !query.is_empty() {
            params.push(("q", query.to_string()));
        }
        if !page_token.is_empty() {
            params.push(("pageToken", page_token.to_string()));
        }

        let body = self.fetch_with_retry("messages.list", &url, &params).await?;
        let list: GmailMessageList =
            serde_json::from_str(&body).map_err(|source| ConnectorError::Decode {
                what: "gmail message list".to_string(),
                source,
            })?;

        Ok(MessagePage {
            handles: list.messages.unwrap_or_default(),
            next_page_token: list.next_page_token.unwrap_or_default(),
        })
    }

    async fn fetch_message(&self, id: &str) -> Result<GmailMessage, ConnectorError> {
        let url = format!("{}/users/me/messages/{id}", self.api_base);
        let params = [("format", "full".to_string())];

        let body = match self.fetch_with_retry("messages.get", &url, &params).await {
            Err(ConnectorError::Status { status: 404, .. }) => {
                return Err(ConnectorError::NotFound(id.to_string()))
            }
            other => other?,
        };
        serde_json::from_str(&body).map_err(|source| ConnectorError::Decode {
            what: format!("gmail message {id}"),
            source,
        })
    }
}

// --- Gmail API response types ---

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
struct GmailMessageList {
    messages: Option<Vec<MessageHandle>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
    #[serde(rename = "resultSizeEstimate")]
    result_size_estimate: Option<u64>,
}

/// A message as returned by `users.messages.get?format=full`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GmailMessage {
    pub id: String,
    #[serde(rename = "threadId", default)]
    pub thread_id: String,
    #[serde(rename = "labelIds", default, skip_serializing_if = "Option::is_none")]
    pub label_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default)]
    pub payload: GmailPayload,
    /// Milliseconds since the epoch, as a decimal string.
    #[serde(rename = "internalDate", default, skip_serializing_if = "Option::is_none")]
    pub internal_date: Option<String>,
    #[serde(rename = "historyId", default, skip_serializing_if = "Option::is_none")]
    pub history_id: Option<String>,
    #[serde(rename = "sizeEstimate", default, skip_serializing_if = "Option::is_none")]
    pub size_estimate: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GmailPayload {
    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Vec<GmailHeader>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<GmailBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<GmailPayload>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GmailHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GmailBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// base64url content; absent for attachments and multipart containers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(rename = "attachmentId", default, skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::{GmailMessage, GmailMessageList};

    #[test]
    fn message_list_deserializes_handles_and_token() {
        let payload = r#"{
            "messages": [{"id": "m1", "threadId": "t1"}, {"id": "m2", "threadId": "t2"}],
            "nextPageToken": "page-2",
            "resultSizeEstimate": 2
        }"#;
        let list: GmailMessageList = serde_json::from_str(payload).expect("decode list");
        let messages = list.messages.expect("messages present");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].thread_id, "t2");
        assert_eq!(list.next_page_token.as_deref(), Some("page-2"));
    }

    #[test]
    fn last_page_has_no_messages_field() {
        let list: GmailMessageList =
            serde_json::from_str(r#"{"resultSizeEstimate": 0}"#).expect("decode empty list");
        assert!(list.messages.is_none());
        assert!(list.next_page_token.is_none());
    }

    #[test]
    fn full_message_deserializes_nested_parts() {
        let payload = r#"{
            "id": "18c2",
            "threadId": "18c2",
            "labelIds": ["Label_7"],
            "internalDate": "1700000000000",
            "payload": {
                "mimeType": "multipart/alternative",
                "headers": [
                    {"name": "From", "value": "Chef <chef@example.com>"},
                    {"name": "Subject", "value": "Soup"}
                ],
                "body": {"size": 0},
                "parts": [
                    {"mimeType": "text/plain", "body": {"size": 5, "data": "cGxhaW4"}},
                    {"mimeType": "text/html", "body": {"size": 13, "data": "PGI-aHRtbDwvYj4"}}
                ]
            }
        }"#;
        let message: GmailMessage = serde_json::from_str(payload).expect("decode message");
        assert_eq!(message.internal_date.as_deref(), Some("1700000000000"));
        let parts = message.payload.parts.expect("parts present");
        assert_eq!(parts[1].mime_type.as_deref(), Some("text/html"));
        assert_eq!(
            parts[1].body.as_ref().and_then(|b| b.data.as_deref()),
            Some("PGI-aHRtbDwvYj4")
        );
        assert!(message.history_id.is_none());
    }

    #[test]
    fn minimal_message_uses_defaults() {
        let message: GmailMessage = serde_json::from_str(r#"{"id": "m1"}"#).expect("decode");
        assert_eq!(message.thread_id, "");
        assert!(message.payload.headers.is_none());
        assert!(message.payload.parts.is_none());
    }
}
