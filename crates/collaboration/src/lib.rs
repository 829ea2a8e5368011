/// Collaborative document editing core
/// Access control, realtime document store and debounced last-writer-wins sync
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

mod auth;
pub use auth::*;

mod document;
pub use document::*;

mod permissions;
pub use permissions::*;

pub mod store;
pub use store::{DocumentStore, MemoryStore, SqliteStore, Subscription};

mod service;
pub use service::*;

mod client;
pub use client::*;

pub mod protocol;

mod server;
pub use server::*;

mod debounce;
pub use debounce::*;

mod editor;
pub use editor::*;

mod dashboard;
pub use dashboard::*;

pub mod config;
pub use config::Config;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaborationError {
    #[error("not signed in")]
    Unauthenticated,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("session closed")]
    Closed,
}

impl CollaborationError {
    /// Stable code used when the error crosses the wire
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::AuthFailed(_) => "auth_failed",
            Self::PermissionDenied(_) => "permission_denied",
            Self::DocumentNotFound(_) => "not_found",
            Self::InvalidInput(_) => "invalid_input",
            Self::StorageError(_) => "storage",
            Self::NetworkError(_) => "network",
            Self::SerializationError(_) => "serialization",
            Self::ConfigError(_) => "config",
            Self::Closed => "closed",
        }
    }

    /// Detail text without the variant prefix
    pub fn detail(&self) -> String {
        match self {
            Self::Unauthenticated | Self::Closed => String::new(),
            Self::AuthFailed(m)
            | Self::PermissionDenied(m)
            | Self::DocumentNotFound(m)
            | Self::InvalidInput(m)
            | Self::StorageError(m)
            | Self::NetworkError(m)
            | Self::SerializationError(m)
            | Self::ConfigError(m) => m.clone(),
        }
    }

    /// Rebuild an error from its wire code and detail
    pub fn from_wire(code: &str, detail: String) -> Self {
        match code {
            "unauthenticated" => Self::Unauthenticated,
            "auth_failed" => Self::AuthFailed(detail),
            "permission_denied" => Self::PermissionDenied(detail),
            "not_found" => Self::DocumentNotFound(detail),
            "invalid_input" => Self::InvalidInput(detail),
            "storage" => Self::StorageError(detail),
            "serialization" => Self::SerializationError(detail),
            "config" => Self::ConfigError(detail),
            "closed" => Self::Closed,
            _ => Self::NetworkError(detail),
        }
    }
}

impl From<rusqlite::Error> for CollaborationError {
    fn from(e: rusqlite::Error) -> Self {
        Self::StorageError(e.to_string())
    }
}

impl From<serde_json::Error> for CollaborationError {
    fn from(e: serde_json::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<figment::Error> for CollaborationError {
    fn from(e: figment::Error) -> Self {
        Self::ConfigError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CollaborationError>;

/// User identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub uuid::Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Document identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentId(pub uuid::Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DocumentId {
    type Err = CollaborationError;

    fn from_str(s: &str) -> Result<Self> {
        uuid::Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| CollaborationError::InvalidInput(format!("bad document id {s:?}: {e}")))
    }
}

/// Milliseconds since the Unix epoch, the recency key for documents
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
