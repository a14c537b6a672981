use serde::Serialize;
use thiserror::Error;

use crate::auth::AuthError;
use crate::connectors::ConnectorError;
use crate::db::DbError;
use crate::extract::ExtractError;

/// Errors surfaced by a sync run. Only `Fetch` and `Decode` are scoped to a
/// single message; everything else ends the run.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("authentication failed: {0}")]
    Auth(#[source] ConnectorError),

    #[error("listing messages failed after {attempts} attempt(s): {source}")]
    List {
        attempts: u32,
        #[source]
        source: ConnectorError,
    },

    #[error("fetching message {id} failed: {source}")]
    Fetch {
        id: String,
        #[source]
        source: ConnectorError,
    },

    #[error("decoding message {id} failed: {source}")]
    Decode {
        id: String,
        #[source]
        source: ExtractError,
    },

    #[error("storing message {id} failed after {attempts} attempt(s): {source}")]
    Store {
        id: String,
        attempts: u32,
        #[source]
        source: DbError,
    },

    #[error("pipeline task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Auth,
    List,
    Fetch,
    Decode,
    Store,
    Task,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::List => "list",
            Self::Fetch => "fetch",
            Self::Decode => "decode",
            Self::Store => "store",
            Self::Task => "task",
        }
    }
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(_) => ErrorKind::Auth,
            Self::List { .. } => ErrorKind::List,
            Self::Fetch { .. } => ErrorKind::Fetch,
            Self::Decode { .. } => ErrorKind::Decode,
            Self::Store { .. } => ErrorKind::Store,
            Self::Task(_) => ErrorKind::Task,
        }
    }

    pub fn is_run_fatal(&self) -> bool {
        !matches!(self, Self::Fetch { .. } | Self::Decode { .. })
    }

    /// Classifies a listing failure; rejected credentials are reported as `Auth`.
    pub fn from_list(attempts: u32, source: ConnectorError) -> Self {
        match source {
            ConnectorError::Auth(_) => Self::Auth(source),
            source => Self::List { attempts, source },
        }
    }

    /// The message this error is scoped to, if any.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::Fetch { id, .. } | Self::Decode { id, .. } | Self::Store { id, .. } => {
                Some(id.as_str())
            }
            _ => None,
        }
    }
}

impl From<AuthError> for SyncError {
    fn from(error: AuthError) -> Self {
        Self::Auth(ConnectorError::Auth(error))
    }
}
