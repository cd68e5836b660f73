use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use super::autosave::{AutosaveCoordinator, SaveOutcome, SaveStatus};
use super::broadcaster::ContentBroadcaster;
use super::buffer::EditorBuffer;
use super::lock_manager::{LockManager, TakeoverConfirmed};
use super::notice::{Notice, Notifier};
use super::Collaborators;
use crate::error::{CollabError, StoreError};
use crate::models::LockStatus;

/// Blocking banner shown while someone else holds the lock.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockBanner {
    pub holder_id: String,
    pub display_name: String,
    pub avatar: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub can_force_takeover: bool,
    /// Always `false`: the banner stays until the lock state changes.
    pub dismissible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    /// Broadcast queued and autosave scheduled.
    Accepted,
    /// The session is read-only; nothing changed.
    ReadOnly,
}

/// One open editor on one document: lock, live broadcast and autosave bound
/// together. Create with [`EditorSession::open`], finish with
/// [`EditorSession::close`].
pub struct EditorSession {
    document_id: Uuid,
    session_id: String,
    buffer: Arc<dyn EditorBuffer>,
    lock: Arc<LockManager>,
    broadcaster: Arc<ContentBroadcaster>,
    autosave: Arc<AutosaveCoordinator>,
    closed: bool,
}

impl EditorSession {
    /// Mount: subscribe to presence and the document channel, then run the
    /// initial lock check. Notices for the user arrive on the returned
    /// receiver.
    pub async fn open(
        collab: &Collaborators,
        document_id: Uuid,
        user_id: impl Into<String>,
        buffer: Arc<dyn EditorBuffer>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Notice>), CollabError> {
        let user_id = user_id.into();
        let session_id = Uuid::new_v4().to_string();
        let settings = &collab.settings;
        let (notifier, notices) = Notifier::channel();
        let gate = Arc::new(Mutex::new(()));

        let lock = Arc::new(LockManager::new(
            document_id,
            user_id.clone(),
            session_id.clone(),
            collab,
            notifier.clone(),
        ));

        // Subscribe before reading so no change between the read and the
        // subscription is missed.
        let presence = collab
            .store
            .subscribe(document_id)
            .await
            .map_err(|e| match e {
                StoreError::DocumentNotFound(id) => CollabError::DocumentNotFound(id),
                e => e.into(),
            })?;

        let broadcaster = Arc::new(ContentBroadcaster::new(
            document_id,
            session_id.clone(),
            user_id.clone(),
            collab.channel.clone(),
            lock.clone(),
            buffer.clone(),
            gate.clone(),
            settings.broadcast_coalesce,
        ));
        broadcaster.subscribe().await?;

        let autosave = Arc::new(AutosaveCoordinator::new(
            document_id,
            user_id.clone(),
            collab.store.clone(),
            collab.clock.clone(),
            lock.clone(),
            notifier,
            gate,
            settings.autosave_debounce,
        ));

        let state = lock.check_initial().await?;
        lock.watch_presence(presence);
        info!(
            "Session {} opened document {} for {} ({:?})",
            session_id, document_id, user_id, state
        );

        Ok((
            Self {
                document_id,
                session_id,
                buffer,
                lock,
                broadcaster,
                autosave,
                closed: false,
            },
            notices,
        ))
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn lock_status(&self) -> LockStatus {
        self.lock.status()
    }

    pub fn watch_lock(&self) -> watch::Receiver<LockStatus> {
        self.lock.watch()
    }

    pub fn is_read_only(&self) -> bool {
        self.lock.state().is_read_only()
    }

    pub fn banner(&self) -> Option<LockBanner> {
        let status = self.lock.status();
        let holder_id = status.state.holder()?.to_string();
        let (display_name, avatar) = match status.holder {
            Some(profile) => (profile.display_name, profile.avatar),
            None => (holder_id.clone(), None),
        };
        Some(LockBanner {
            holder_id,
            display_name,
            avatar,
            locked_at: status.locked_at,
            can_force_takeover: true,
            dismissible: false,
        })
    }

    /// The host reports that the user changed the buffer.
    pub fn on_local_change(&self) -> EditOutcome {
        if self.is_read_only() {
            return EditOutcome::ReadOnly;
        }
        let content = self.buffer.content();
        self.broadcaster.publish(&content);
        self.autosave.schedule(content);
        EditOutcome::Accepted
    }

    /// Replace the buffer with `content` as a local edit. Read-only sessions
    /// leave the buffer untouched.
    pub fn edit(&self, content: serde_json::Value) -> EditOutcome {
        if self.is_read_only() {
            return EditOutcome::ReadOnly;
        }
        self.buffer.replace_content(content);
        self.on_local_change()
    }

    /// Explicit save of the current buffer.
    pub async fn save(&self) -> Result<SaveOutcome, CollabError> {
        self.autosave.save(self.buffer.content()).await
    }

    pub async fn force_takeover(&self, confirmed: TakeoverConfirmed) -> Result<(), CollabError> {
        self.lock.force_takeover(confirmed).await
    }

    pub fn save_status(&self) -> SaveStatus {
        self.autosave.status()
    }

    pub fn watch_save(&self) -> watch::Receiver<SaveStatus> {
        self.autosave.watch()
    }

    /// Flush a pending save, stop all tasks, release the lock if held and
    /// finally run `on_close`, which runs even when a step before it failed.
    pub async fn close<F: FnOnce()>(mut self, on_close: F) -> Result<(), CollabError> {
        self.closed = true;

        let flushed = if self.lock.is_held_by_self() {
            self.autosave.flush().await.map(|_| ())
        } else {
            Ok(())
        };
        self.autosave.cancel();
        self.broadcaster.shutdown();
        self.lock.shutdown();
        let released = self.lock.release().await.map(|_| ());
        info!("Session {} closed document {}", self.session_id, self.document_id);

        on_close();
        flushed.and(released)
    }
}

impl Drop for EditorSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.autosave.cancel();
        self.broadcaster.shutdown();
        self.lock.shutdown();

        if !self.lock.is_held_by_self() {
            return;
        }
        let lock = self.lock.clone();
        let document_id = self.document_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = lock.release().await {
                        warn!("Best-effort release of document {} failed: {}", document_id, e);
                    }
                });
            }
            Err(_) => warn!("Session on document {} dropped outside a runtime, lock not released", document_id),
        }
    }
}
