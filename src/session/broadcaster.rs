use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::buffer::EditorBuffer;
use super::lock_manager::LockManager;
use crate::error::CollabError;
use crate::ws::{ChangeChannel, ChannelMessage, ContentSnapshot, Envelope};

/// Streams the writer's in-progress content to every viewer of the document
/// and applies incoming content on the viewer side.
///
/// Publishing goes through a latest-value slot drained by a pump task, so a
/// burst of keystrokes collapses into at most one message per coalesce window.
pub struct ContentBroadcaster {
    document_id: Uuid,
    session_id: String,
    user_id: String,
    channel: Arc<dyn ChangeChannel>,
    lock: Arc<LockManager>,
    buffer: Arc<dyn EditorBuffer>,
    gate: Arc<Mutex<()>>,
    coalesce: Duration,
    revision: AtomicU64,
    latest: watch::Sender<Option<serde_json::Value>>,
    // Last revision applied per sending session
    applied: StdMutex<HashMap<String, u64>>,
    receiver: StdMutex<Option<JoinHandle<()>>>,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

impl ContentBroadcaster {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        document_id: Uuid,
        session_id: String,
        user_id: String,
        channel: Arc<dyn ChangeChannel>,
        lock: Arc<LockManager>,
        buffer: Arc<dyn EditorBuffer>,
        gate: Arc<Mutex<()>>,
        coalesce: Duration,
    ) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            document_id,
            session_id,
            user_id,
            channel,
            lock,
            buffer,
            gate,
            coalesce,
            revision: AtomicU64::new(0),
            latest,
            applied: StdMutex::new(HashMap::new()),
            receiver: StdMutex::new(None),
            pump: StdMutex::new(None),
        }
    }

    /// Open the document channel and start the receive and publish tasks.
    pub async fn subscribe(self: &Arc<Self>) -> Result<(), CollabError> {
        let mut rx = self.channel.subscribe(self.document_id).await?;

        let weak = Arc::downgrade(self);
        let document_id = self.document_id;
        let receiver = tokio::spawn(async move {
            loop {
                let envelope = match rx.recv().await {
                    Ok(envelope) => envelope,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Broadcast receiver for {} skipped {} messages", document_id, skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Broadcast channel for {} closed", document_id);
                        break;
                    }
                };
                let Some(broadcaster) = weak.upgrade() else { break };
                broadcaster.receive(envelope).await;
            }
        });

        let mut latest = self.latest.subscribe();
        let weak = Arc::downgrade(self);
        let coalesce = self.coalesce;
        let pump = tokio::spawn(async move {
            while latest.changed().await.is_ok() {
                let Some(content) = latest.borrow_and_update().clone() else { continue };
                let Some(broadcaster) = weak.upgrade() else { break };
                broadcaster.send(content).await;
                drop(broadcaster);
                tokio::time::sleep(coalesce).await;
            }
        });

        Self::replace_task(&self.receiver, receiver);
        Self::replace_task(&self.pump, pump);
        Ok(())
    }

    /// Queue the current content for broadcast. Returns `false` without
    /// queueing anything unless this session holds the lock.
    pub fn publish(&self, content: &serde_json::Value) -> bool {
        if !self.lock.is_held_by_self() {
            debug!("Not publishing to {}, session is not the writer", self.document_id);
            return false;
        }
        self.latest.send_replace(Some(content.clone()));
        true
    }

    /// Handle one message from the document channel.
    pub async fn receive(&self, envelope: Envelope) -> bool {
        if envelope.document_id != self.document_id || envelope.sender_id == self.session_id {
            return false;
        }

        match envelope.message {
            ChannelMessage::Content(snapshot) => self.apply_remote(&envelope.sender_id, snapshot).await,
            ChannelMessage::Takeover(notice) => {
                if let Err(e) = self.lock.observe_takeover(&notice).await {
                    warn!("Failed to handle takeover notice for {}: {}", self.document_id, e);
                }
                false
            }
        }
    }

    /// Apply a snapshot from another session to the local buffer, keeping the
    /// selection. Only spectators apply; stale and duplicate revisions are
    /// dropped. Returns whether the buffer changed.
    pub async fn apply_remote(&self, sender_id: &str, snapshot: ContentSnapshot) -> bool {
        let _gate = self.gate.lock().await;

        let state = self.lock.state();
        let Some(holder) = state.holder() else {
            debug!(
                "Ignoring content for {} from {}, local session is not a spectator",
                self.document_id, sender_id
            );
            return false;
        };
        if holder != snapshot.author {
            debug!(
                "Ignoring content for {} by {}, the lock is held by {}",
                self.document_id, snapshot.author, holder
            );
            return false;
        }

        {
            let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
            if applied
                .get(sender_id)
                .is_some_and(|&revision| revision >= snapshot.revision)
            {
                return false;
            }
            applied.insert(sender_id.to_string(), snapshot.revision);
        }

        if self.buffer.content() == snapshot.content {
            return false;
        }

        let selection = self.buffer.selection();
        self.buffer.replace_content(snapshot.content);
        self.buffer.set_selection(selection);
        debug!(
            "Applied revision {} of {} from {}",
            snapshot.revision, self.document_id, snapshot.author
        );
        true
    }

    pub fn shutdown(&self) {
        for slot in [&self.receiver, &self.pump] {
            if let Some(task) = slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
                task.abort();
            }
        }
    }

    async fn send(&self, content: serde_json::Value) {
        // The lock may have moved on while the content sat in the slot.
        if !self.lock.is_held_by_self() {
            debug!("Dropping queued content for {}, lock no longer held", self.document_id);
            return;
        }

        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = Envelope {
            sender_id: self.session_id.clone(),
            document_id: self.document_id,
            message: ChannelMessage::Content(ContentSnapshot {
                revision,
                author: self.user_id.clone(),
                content,
            }),
        };
        if let Err(e) = self.channel.publish(envelope).await {
            warn!("Failed to broadcast revision {} of {}: {}", revision, self.document_id, e);
        }
    }

    fn replace_task(slot: &StdMutex<Option<JoinHandle<()>>>, task: JoinHandle<()>) {
        if let Some(old) = slot.lock().unwrap_or_else(|e| e.into_inner()).replace(task) {
            old.abort();
        }
    }
}

impl Drop for ContentBroadcaster {
    fn drop(&mut self) {
        self.shutdown();
    }
}
