//! Error types for the collaboration core and its collaborators.

use thiserror::Error;
use uuid::Uuid;

/// Failures reported by a [`DocumentStore`](crate::db::DocumentStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The document row does not exist.
    #[error("document not found: {0}")]
    DocumentNotFound(Uuid),

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A database query failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migrations could not be applied.
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Failures reported by a [`ChangeChannel`](crate::ws::ChangeChannel).
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel for the document is no longer open.
    #[error("channel closed for document {0}")]
    Closed(Uuid),

    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A payload could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for ChannelError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Failures reported by a [`UserDirectory`](crate::clients::UserDirectory).
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// No profile exists for the user.
    #[error("user not found: {0}")]
    UserNotFound(String),

    /// The directory service could not be queried.
    #[error("directory request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The service token could not be signed.
    #[error("failed to sign service token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

/// Top-level error of an editor session.
#[derive(Debug, Error)]
pub enum CollabError {
    /// The document opened by the session does not exist.
    #[error("document not found: {0}")]
    DocumentNotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}
