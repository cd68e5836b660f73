use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::lock_manager::LockManager;
use super::notice::{Notice, Notifier};
use crate::clock::Clock;
use crate::db::DocumentStore;
use crate::error::CollabError;
use crate::utils::defer::Defer;

/// Save progress exposed to the shell.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveStatus {
    pub last_saved_at: Option<DateTime<Utc>>,
    pub is_saving: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// The session does not hold the lock, locally or according to the store.
    /// The pending content is discarded.
    Refused,
    NothingPending,
}

#[derive(Default)]
struct Timer {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// Debounced persistence of the writer's content, gated on the lock.
pub struct AutosaveCoordinator {
    document_id: Uuid,
    user_id: String,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    lock: Arc<LockManager>,
    notifier: Notifier,
    gate: Arc<Mutex<()>>,
    debounce: Duration,
    pending: StdMutex<Option<serde_json::Value>>,
    timer: StdMutex<Timer>,
    status: watch::Sender<SaveStatus>,
}

impl AutosaveCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        document_id: Uuid,
        user_id: String,
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        lock: Arc<LockManager>,
        notifier: Notifier,
        gate: Arc<Mutex<()>>,
        debounce: Duration,
    ) -> Self {
        let (status, _) = watch::channel(SaveStatus::default());
        Self {
            document_id,
            user_id,
            store,
            clock,
            lock,
            notifier,
            gate,
            debounce,
            pending: StdMutex::new(None),
            timer: StdMutex::new(Timer::default()),
            status,
        }
    }

    pub fn status(&self) -> SaveStatus {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SaveStatus> {
        self.status.subscribe()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Record `content` as pending and restart the quiet period. Returns
    /// `false` and records nothing unless this session holds the lock.
    pub fn schedule(self: &Arc<Self>, content: serde_json::Value) -> bool {
        if !self.lock.is_held_by_self() {
            debug!("Not scheduling save of {}, lock not held", self.document_id);
            return false;
        }
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(content);
        self.arm();
        true
    }

    /// Persist `content` right away, skipping the debounce.
    pub async fn save(self: &Arc<Self>, content: serde_json::Value) -> Result<SaveOutcome, CollabError> {
        self.disarm_all();
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(content);
        self.persist().await
    }

    /// Persist whatever is pending right away.
    pub async fn flush(self: &Arc<Self>) -> Result<SaveOutcome, CollabError> {
        self.disarm_all();
        self.persist().await
    }

    /// Stop the timer and drop pending content.
    pub fn cancel(&self) {
        self.disarm_all();
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    async fn persist(self: &Arc<Self>) -> Result<SaveOutcome, CollabError> {
        let _gate = self.gate.lock().await;

        let Some(content) = self.pending.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return Ok(SaveOutcome::NothingPending);
        };

        if !self.lock.is_held_by_self() {
            info!("Save of document {} refused, lock not held by this session", self.document_id);
            return Ok(SaveOutcome::Refused);
        }

        self.status.send_modify(|s| s.is_saving = true);
        let _saving = Defer::new(|| self.status.send_modify(|s| s.is_saving = false));

        let now = self.clock.now();
        match self
            .store
            .save_content(self.document_id, &self.user_id, &content, now)
            .await
        {
            Ok(true) => {
                debug!("Saved document {} at {}", self.document_id, now);
                self.status.send_modify(|s| {
                    s.last_saved_at = Some(now);
                    s.last_error = None;
                });
                Ok(SaveOutcome::Saved)
            }
            Ok(false) => {
                warn!("Store refused save of document {}, re-syncing lock", self.document_id);
                self.lock.resync().await?;
                Ok(SaveOutcome::Refused)
            }
            Err(e) => {
                error!("Failed to save document {}: {}", self.document_id, e);
                {
                    let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                    if pending.is_none() {
                        *pending = Some(content);
                    }
                }
                let message = e.to_string();
                self.status.send_modify(|s| s.last_error = Some(message.clone()));
                self.notifier.send(Notice::SaveFailed { message });
                self.arm();
                Err(e.into())
            }
        }
    }

    fn arm(self: &Arc<Self>) {
        let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        timer.generation += 1;
        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }

        let generation = timer.generation;
        let weak = Arc::downgrade(self);
        let debounce = self.debounce;
        timer.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let Some(autosave) = weak.upgrade() else { return };
            // From here on a re-arm must not abort this task mid-save.
            autosave.disarm(generation);
            if let Err(e) = autosave.persist().await {
                debug!("Autosave of {} will be retried: {}", autosave.document_id, e);
            }
        }));
    }

    fn disarm(&self, generation: u64) {
        let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        if timer.generation == generation {
            timer.handle = None;
        }
    }

    fn disarm_all(&self) {
        let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        timer.generation += 1;
        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for AutosaveCoordinator {
    fn drop(&mut self) {
        self.disarm_all();
    }
}
