use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::{DocumentRow, DocumentStore, Presence};
use crate::error::StoreError;

struct Entry {
    row: DocumentRow,
    saves: usize,
    presence_tx: broadcast::Sender<Presence>,
}

/// In-process presence store. Used when no database is configured and by
/// tests; every lock write is fanned out to the document's subscribers.
pub struct MemoryDocumentStore {
    docs: Mutex<HashMap<Uuid, Entry>>,
    capacity: usize,
    unavailable: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            docs: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Seed a document row.
    pub fn insert(&self, row: DocumentRow) {
        let mut docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        let (presence_tx, _) = broadcast::channel(self.capacity);
        docs.insert(
            row.id,
            Entry {
                row,
                saves: 0,
                presence_tx,
            },
        );
    }

    /// Number of content writes that reached the store.
    pub fn save_count(&self, document_id: Uuid) -> usize {
        let docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        docs.get(&document_id).map_or(0, |entry| entry.saves)
    }

    /// Simulate the store dropping off the network.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    fn with_entry<T>(
        &self,
        document_id: Uuid,
        f: impl FnOnce(&mut Entry) -> T,
    ) -> Result<T, StoreError> {
        self.check_available()?;
        let mut docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        let entry = docs
            .get_mut(&document_id)
            .ok_or(StoreError::DocumentNotFound(document_id))?;
        Ok(f(entry))
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new(64)
    }
}

fn set_lock(entry: &mut Entry, locked_by: Option<String>, locked_at: Option<DateTime<Utc>>) {
    entry.row.locked_by = locked_by;
    entry.row.locked_at = locked_at;
    // Nobody listening is fine.
    let _ = entry.presence_tx.send(entry.row.presence());
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, document_id: Uuid) -> Result<Option<DocumentRow>, StoreError> {
        self.check_available()?;
        let docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(docs.get(&document_id).map(|entry| entry.row.clone()))
    }

    async fn try_lock(
        &self,
        document_id: Uuid,
        user_id: &str,
        at: DateTime<Utc>,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<Presence, StoreError> {
        self.with_entry(document_id, |entry| {
            let stale = match (stale_before, entry.row.locked_at) {
                (Some(cutoff), Some(locked_at)) => locked_at < cutoff,
                _ => false,
            };
            let claimable = match entry.row.locked_by.as_deref() {
                None => true,
                Some(holder) => holder == user_id || stale,
            };
            if claimable {
                set_lock(entry, Some(user_id.to_string()), Some(at));
            } else {
                debug!("Lock on {} stays with {:?}", document_id, entry.row.locked_by);
            }
            entry.row.presence()
        })
    }

    async fn force_lock(
        &self,
        document_id: Uuid,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError> {
        self.with_entry(document_id, |entry| {
            let previous = entry.row.locked_by.clone();
            set_lock(entry, Some(user_id.to_string()), Some(at));
            previous
        })
    }

    async fn touch_lock(
        &self,
        document_id: Uuid,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.with_entry(document_id, |entry| {
            if entry.row.locked_by.as_deref() != Some(user_id) {
                return false;
            }
            set_lock(entry, Some(user_id.to_string()), Some(at));
            true
        })
    }

    async fn release_lock(&self, document_id: Uuid, user_id: &str) -> Result<bool, StoreError> {
        self.with_entry(document_id, |entry| {
            if entry.row.locked_by.as_deref() != Some(user_id) {
                return false;
            }
            set_lock(entry, None, None);
            true
        })
    }

    async fn save_content(
        &self,
        document_id: Uuid,
        user_id: &str,
        content: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.with_entry(document_id, |entry| {
            if entry.row.locked_by.as_deref() != Some(user_id) {
                return false;
            }
            entry.row.content = content.clone();
            entry.row.updated_at = at;
            entry.row.updated_by = Some(user_id.to_string());
            entry.saves += 1;
            true
        })
    }

    async fn subscribe(&self, document_id: Uuid) -> Result<broadcast::Receiver<Presence>, StoreError> {
        self.with_entry(document_id, |entry| entry.presence_tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with_doc() -> (MemoryDocumentStore, Uuid) {
        let store = MemoryDocumentStore::default();
        let id = Uuid::new_v4();
        store.insert(DocumentRow::new(id, json!({}), Utc::now()));
        (store, id)
    }

    #[tokio::test]
    async fn try_lock_only_claims_a_free_lock() {
        let (store, id) = store_with_doc();
        let now = Utc::now();

        let first = store.try_lock(id, "alice", now, None).await.unwrap();
        assert!(first.is_held_by("alice"));

        let second = store.try_lock(id, "bob", now, None).await.unwrap();
        assert!(second.is_held_by("alice"));
    }

    #[tokio::test]
    async fn try_lock_reclaims_a_stale_lock_when_asked() {
        let (store, id) = store_with_doc();
        let then = Utc::now() - chrono::Duration::minutes(30);
        store.try_lock(id, "alice", then, None).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(5);
        let presence = store.try_lock(id, "bob", Utc::now(), Some(cutoff)).await.unwrap();
        assert!(presence.is_held_by("bob"));
    }

    #[tokio::test]
    async fn only_the_holder_can_touch_release_or_save() {
        let (store, id) = store_with_doc();
        let now = Utc::now();
        store.try_lock(id, "alice", now, None).await.unwrap();

        assert!(!store.touch_lock(id, "bob", now).await.unwrap());
        assert!(!store.release_lock(id, "bob").await.unwrap());
        assert!(!store.save_content(id, "bob", &json!({"x": 1}), now).await.unwrap());
        assert_eq!(store.save_count(id), 0);

        assert!(store.save_content(id, "alice", &json!({"x": 1}), now).await.unwrap());
        assert_eq!(store.save_count(id), 1);
        assert!(store.release_lock(id, "alice").await.unwrap());
        assert_eq!(store.get(id).await.unwrap().unwrap().locked_by, None);
    }

    #[tokio::test]
    async fn force_lock_reports_the_previous_holder() {
        let (store, id) = store_with_doc();
        let mut rx = store.subscribe(id).await.unwrap();
        store.try_lock(id, "alice", Utc::now(), None).await.unwrap();

        let previous = store.force_lock(id, "bob", Utc::now()).await.unwrap();
        assert_eq!(previous.as_deref(), Some("alice"));

        assert!(rx.recv().await.unwrap().is_held_by("alice"));
        assert!(rx.recv().await.unwrap().is_held_by("bob"));
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let (store, id) = store_with_doc();
        store.set_unavailable(true);
        assert!(matches!(store.get(id).await, Err(StoreError::Unavailable(_))));
        assert!(matches!(
            store.try_lock(id, "alice", Utc::now(), None).await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn missing_document_is_reported() {
        let store = MemoryDocumentStore::default();
        let id = Uuid::new_v4();
        assert!(store.get(id).await.unwrap().is_none());
        assert!(matches!(
            store.release_lock(id, "alice").await,
            Err(StoreError::DocumentNotFound(missing)) if missing == id
        ));
    }
}
