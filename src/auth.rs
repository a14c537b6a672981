use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info};

use crate::config::{self, ENV_CLIENT_ID, ENV_CLIENT_SECRET, ENV_REFRESH_TOKEN, ENV_TOKEN_URL};
use crate::connectors::redact_response_body;

pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const GMAIL_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";
const DEFAULT_REDIRECT_URI: &str = "http://localhost";
const AUTH_STATE: &str = "state-token";
const CACHE_SKEW_SECONDS: i64 = 60;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing gmail {0}")]
    Missing(String),

    #[error("access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("token request to {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("oauth token request failed: status={status} body={body}")]
    Rejected { status: u16, body: String },

    #[error("decode oauth token response: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("authorization aborted: {0}")]
    Aborted(String),
}

/// Where the OAuth client secrets and the saved user token live on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPaths {
    pub credentials: PathBuf,
    pub token: PathBuf,
}

impl AuthPaths {
    pub fn new(credentials: impl Into<PathBuf>, token: impl Into<PathBuf>) -> Self {
        Self {
            credentials: credentials.into(),
            token: token.into(),
        }
    }
}

/// Everything needed to mint access tokens with the refresh-token grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GmailCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub token_url: String,
}

impl GmailCredentials {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            refresh_token: refresh_token.into(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
        }
    }

    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }

    /// Environment variables first, then `credentials.json` and `token.json`.
    pub fn resolve(paths: &AuthPaths) -> Result<Self, AuthError> {
        Self::resolve_with(paths, config::env_non_empty)
    }

    fn resolve_with(
        paths: &AuthPaths,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, AuthError> {
        let secrets = ClientSecrets::load_optional(&paths.credentials)?;
        let saved = StoredToken::load(&paths.token)?;

        let client_id = env(ENV_CLIENT_ID)
            .or_else(|| secrets.as_ref().map(|s| s.client_id.clone()))
            .ok_or_else(|| {
                AuthError::Missing(format!(
                    "client id ({ENV_CLIENT_ID} or {})",
                    paths.credentials.display()
                ))
            })?;

        let client_secret = env(ENV_CLIENT_SECRET)
            .or_else(|| secrets.as_ref().map(|s| s.client_secret.clone()))
            .ok_or_else(|| {
                AuthError::Missing(format!(
                    "client secret ({ENV_CLIENT_SECRET} or {})",
                    paths.credentials.display()
                ))
            })?;

        let refresh_token = env(ENV_REFRESH_TOKEN)
            .or_else(|| {
                saved
                    .map(|token| token.refresh_token)
                    .filter(|token| !token.trim().is_empty())
            })
            .ok_or_else(|| {
                AuthError::Missing(format!(
                    "refresh token ({ENV_REFRESH_TOKEN} or {}; run `recipe-sync authorize`)",
                    paths.token.display()
                ))
            })?;

        let token_url = env(ENV_TOKEN_URL)
            .or_else(|| secrets.map(|s| s.token_uri))
            .unwrap_or_else(|| GOOGLE_TOKEN_URL.to_string());

        Ok(Self {
            client_id,
            client_secret,
            refresh_token,
            token_url,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

/// The `installed` (or `web`) block of a Google OAuth client secrets file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

fn default_auth_uri() -> String {
    GOOGLE_AUTH_URL.to_string()
}

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URL.to_string()
}

impl ClientSecrets {
    pub fn load(path: &Path) -> Result<Self, AuthError> {
        Self::load_optional(path)?.ok_or_else(|| {
            AuthError::Missing(format!("client secrets file {}", path.display()))
        })
    }

    fn load_optional(path: &Path) -> Result<Option<Self>, AuthError> {
        let Some(raw) = read_optional(path)? else {
            return Ok(None);
        };

        let file: ClientSecretsFile =
            serde_json::from_str(&raw).map_err(|source| AuthError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        file.installed
            .or(file.web)
            .map(Some)
            .ok_or_else(|| {
                AuthError::Missing(format!(
                    "`installed` or `web` client in {}",
                    path.display()
                ))
            })
    }

    pub fn redirect_uri(&self) -> &str {
        self.redirect_uris
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_REDIRECT_URI)
    }

    /// Consent URL for the read-only Gmail scope with offline access.
    pub fn authorization_url(&self) -> Result<String, AuthError> {
        let mut url = Url::parse(&self.auth_uri).map_err(|error| {
            AuthError::Aborted(format!("invalid auth_uri {}: {error}", self.auth_uri))
        })?;
        url.query_pairs_mut()
            .append_pair("access_type", "offline")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", self.redirect_uri())
            .append_pair("response_type", "code")
            .append_pair("scope", GMAIL_READONLY_SCOPE)
            .append_pair("state", AUTH_STATE);
        Ok(url.into())
    }
}

/// Contents of `token.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredToken {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

impl StoredToken {
    /// `Ok(None)` when the file does not exist yet.
    pub fn load(path: &Path) -> Result<Option<Self>, AuthError> {
        let Some(raw) = read_optional(path)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| AuthError::Parse {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Writes the token, readable by the owner only.
    pub fn save(&self, path: &Path) -> Result<(), AuthError> {
        let io_error = |source| AuthError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }

        let json = serde_json::to_string_pretty(self).map_err(AuthError::Decode)?;
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(path).map_err(io_error)?;
        file.write_all(json.as_bytes()).map_err(io_error)?;
        Ok(())
    }
}

/// A short-lived bearer token, expiring slightly ahead of the server's clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
struct OAuthTokenResponse {
    access_token: String,
    token_type: Option<String>,
    expires_in: u64,
    refresh_token: Option<String>,
    scope: Option<String>,
}

pub async fn refresh_access_token(
    client: &Client,
    credentials: &GmailCredentials,
) -> Result<AccessToken, AuthError> {
    let payload = post_token_form(
        client,
        &credentials.token_url,
        &[
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("refresh_token", credentials.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ],
    )
    .await?;

    debug!(expires_in = payload.expires_in, "refreshed gmail access token");
    let expires_at = Utc::now()
        + Duration::seconds((payload.expires_in as i64).saturating_sub(CACHE_SKEW_SECONDS));
    Ok(AccessToken {
        access_token: payload.access_token,
        expires_at,
    })
}

/// Trades a one-time authorization code for a token that carries a refresh token.
pub async fn exchange_code(
    client: &Client,
    secrets: &ClientSecrets,
    token_url: &str,
    code: &str,
) -> Result<StoredToken, AuthError> {
    let payload = post_token_form(
        client,
        token_url,
        &[
            ("client_id", secrets.client_id.as_str()),
            ("client_secret", secrets.client_secret.as_str()),
            ("code", code),
            ("redirect_uri", secrets.redirect_uri()),
            ("grant_type", "authorization_code"),
        ],
    )
    .await?;

    let refresh_token = payload
        .refresh_token
        .filter(|token| !token.trim().is_empty())
        .ok_or_else(|| AuthError::Missing("refresh token in authorization response".to_string()))?;

    Ok(StoredToken {
        access_token: payload.access_token,
        token_type: payload.token_type.unwrap_or_else(|| "Bearer".to_string()),
        refresh_token,
        expiry: Some(Utc::now() + Duration::seconds(payload.expires_in as i64)),
    })
}

/// Prints the consent URL, reads the authorization code from `input`, exchanges
/// it and saves the result to `paths.token`.
pub async fn authorize_interactively<R>(
    client: &Client,
    paths: &AuthPaths,
    input: R,
) -> Result<StoredToken, AuthError>
where
    R: AsyncBufRead + Unpin,
{
    let secrets = ClientSecrets::load(&paths.credentials)?;
    let token_url = config::env_non_empty(ENV_TOKEN_URL).unwrap_or_else(|| secrets.token_uri.clone());

    eprintln!(
        "Go to the following link in your browser then type the authorization code:\n{}",
        secrets.authorization_url()?
    );

    let code = read_code(input).await?;
    let token = exchange_code(client, &secrets, &token_url, &code).await?;
    token.save(&paths.token)?;
    info!(path = %paths.token.display(), "saved gmail token");
    Ok(token)
}

async fn read_code<R>(mut input: R) -> Result<String, AuthError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    input
        .read_line(&mut line)
        .await
        .map_err(|source| AuthError::Io {
            path: PathBuf::from("<stdin>"),
            source,
        })?;

    let code = line.trim();
    if code.is_empty() {
        return Err(AuthError::Aborted("no authorization code entered".to_string()));
    }
    Ok(code.to_string())
}

async fn post_token_form(
    client: &Client,
    token_url: &str,
    form: &[(&str, &str)],
) -> Result<OAuthTokenResponse, AuthError> {
    let response = client
        .post(token_url)
        .form(form)
        .send()
        .await
        .map_err(|source| AuthError::Transport {
            url: token_url.to_string(),
            source,
        })?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|source| AuthError::Transport {
            url: token_url.to_string(),
            source,
        })?;
    if !status.is_success() {
        return Err(AuthError::Rejected {
            status: status.as_u16(),
            body: redact_response_body(&body),
        });
    }

    serde_json::from_str(&body).map_err(AuthError::Decode)
}

fn read_optional(path: &Path) -> Result<Option<String>, AuthError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(AuthError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::{
        read_code, AccessToken, AuthError, AuthPaths, ClientSecrets, GmailCredentials,
        StoredToken, GOOGLE_TOKEN_URL,
    };
    use crate::config::{ENV_CLIENT_ID, ENV_REFRESH_TOKEN};

    const SECRETS_JSON: &str = r#"{
        "installed": {
            "client_id": "file-client-id",
            "client_secret": "file-client-secret",
            "auth_uri": "https://accounts.google.com/o/oauth2/auth",
            "token_uri": "https://oauth2.googleapis.com/token",
            "redirect_uris": ["http://localhost"]
        }
    }"#;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("recipe-sync-auth-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn credentials_resolve_from_files() {
        let dir = temp_dir();
        let paths = AuthPaths::new(dir.join("credentials.json"), dir.join("token.json"));
        std::fs::write(&paths.credentials, SECRETS_JSON).expect("write secrets");
        StoredToken {
            refresh_token: "file-refresh".to_string(),
            ..StoredToken::default()
        }
        .save(&paths.token)
        .expect("save token");

        let credentials = GmailCredentials::resolve_with(&paths, no_env).expect("resolve");
        assert_eq!(credentials.client_id, "file-client-id");
        assert_eq!(credentials.client_secret, "file-client-secret");
        assert_eq!(credentials.refresh_token, "file-refresh");
        assert_eq!(credentials.token_url, GOOGLE_TOKEN_URL);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn environment_overrides_files() {
        let dir = temp_dir();
        let paths = AuthPaths::new(dir.join("credentials.json"), dir.join("token.json"));
        std::fs::write(&paths.credentials, SECRETS_JSON).expect("write secrets");

        let env: HashMap<&str, &str> =
            HashMap::from([(ENV_CLIENT_ID, "env-id"), (ENV_REFRESH_TOKEN, "env-refresh")]);
        let credentials = GmailCredentials::resolve_with(&paths, |name| {
            env.get(name).map(|value| value.to_string())
        })
        .expect("resolve");

        assert_eq!(credentials.client_id, "env-id");
        assert_eq!(credentials.client_secret, "file-client-secret");
        assert_eq!(credentials.refresh_token, "env-refresh");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_token_points_at_authorize() {
        let dir = temp_dir();
        let paths = AuthPaths::new(dir.join("credentials.json"), dir.join("token.json"));
        std::fs::write(&paths.credentials, SECRETS_JSON).expect("write secrets");

        let error = GmailCredentials::resolve_with(&paths, no_env).expect_err("no refresh token");
        assert!(matches!(error, AuthError::Missing(_)));
        assert!(error.to_string().contains("recipe-sync authorize"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn authorization_url_requests_offline_readonly_access() {
        let secrets: ClientSecrets = serde_json::from_str(
            r#"{"client_id":"abc","client_secret":"shh"}"#,
        )
        .expect("decode secrets");
        let url = secrets.authorization_url().expect("url");

        assert!(url.starts_with("https://accounts.google.com/o/oauth2/auth?"));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("client_id=abc"));
        assert!(url.contains("gmail.readonly"));
        assert_eq!(secrets.redirect_uri(), "http://localhost");
    }

    #[test]
    fn saved_token_round_trips() {
        let dir = temp_dir();
        let path = dir.join("nested").join("token.json");
        let token = StoredToken {
            access_token: "ya29.abc".to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: "1//refresh".to_string(),
            expiry: None,
        };
        token.save(&path).expect("save");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let loaded = StoredToken::load(&path).expect("load").expect("token exists");
        assert_eq!(loaded, token);
        assert!(StoredToken::load(&dir.join("absent.json"))
            .expect("load absent")
            .is_none());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn access_token_expiry() {
        let fresh = AccessToken {
            access_token: "a".to_string(),
            expires_at: Utc::now() + Duration::minutes(5),
        };
        let stale = AccessToken {
            expires_at: Utc::now() - Duration::seconds(1),
            ..fresh.clone()
        };
        assert!(!fresh.is_expired());
        assert!(stale.is_expired());
    }

    #[tokio::test]
    async fn blank_code_aborts() {
        let error = read_code(&b"   \n"[..]).await.expect_err("blank input");
        assert!(matches!(error, AuthError::Aborted(_)));
        let code = read_code(&b"4/0Abc \n"[..]).await.expect("code");
        assert_eq!(code, "4/0Abc");
    }
}
