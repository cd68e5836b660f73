//! Presence store: the durable document row and the lock columns on it.
//!
//! `lockedBy`/`lockedAt` are only ever written through the conditional lock
//! operations below, and `content` only through [`DocumentStore::save_content`],
//! which also requires the caller to hold the lock.

pub mod dbscript;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::StoreError;

pub use dbscript::DbScript;
pub use memory::MemoryDocumentStore;

/// Script document row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DocumentRow {
    pub id: Uuid,
    pub content: serde_json::Value,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub updated_by: Option<String>,
}

impl DocumentRow {
    /// A fresh, unlocked document.
    pub fn new(id: Uuid, content: serde_json::Value, at: DateTime<Utc>) -> Self {
        Self {
            id,
            content,
            locked_by: None,
            locked_at: None,
            updated_at: at,
            updated_by: None,
        }
    }

    pub fn presence(&self) -> Presence {
        Presence {
            document_id: self.id,
            locked_by: self.locked_by.clone(),
            locked_at: self.locked_at,
        }
    }
}

/// The lock columns of a document row, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    #[sqlx(rename = "id")]
    pub document_id: Uuid,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
}

impl Presence {
    pub fn is_held_by(&self, user_id: &str) -> bool {
        self.locked_by.as_deref() == Some(user_id)
    }
}

/// Durable store holding documents and their soft lock.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read the full row, `None` when the document does not exist.
    async fn get(&self, document_id: Uuid) -> Result<Option<DocumentRow>, StoreError>;

    /// Take the lock if it is free, already held by `user_id`, or (when
    /// `stale_before` is set) last refreshed before that instant.
    ///
    /// Returns the presence after the attempt; the caller won when
    /// `locked_by == user_id`.
    async fn try_lock(
        &self,
        document_id: Uuid,
        user_id: &str,
        at: DateTime<Utc>,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<Presence, StoreError>;

    /// Take the lock regardless of the current holder. Returns the previous
    /// holder, if any.
    async fn force_lock(
        &self,
        document_id: Uuid,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError>;

    /// Bump `lockedAt` while `user_id` still holds the lock. `false` means the
    /// lock has moved on.
    async fn touch_lock(
        &self,
        document_id: Uuid,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Clear the lock if `user_id` holds it.
    async fn release_lock(&self, document_id: Uuid, user_id: &str) -> Result<bool, StoreError>;

    /// Persist `content` if `user_id` holds the lock. `false` means the write
    /// was refused and nothing changed.
    async fn save_content(
        &self,
        document_id: Uuid,
        user_id: &str,
        content: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Subscribe to lock changes of one document.
    async fn subscribe(&self, document_id: Uuid) -> Result<broadcast::Receiver<Presence>, StoreError>;
}
