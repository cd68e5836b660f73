use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::notice::{Notice, Notifier};
use super::Collaborators;
use crate::clients::{UserDirectory, UserProfile};
use crate::clock::Clock;
use crate::db::{DocumentStore, Presence};
use crate::error::CollabError;
use crate::models::{LockState, LockStatus};
use crate::ws::{ChangeChannel, ChannelMessage, Envelope, TakeoverNotice};

/// Proof that the user confirmed the takeover prompt. The shell builds one
/// only after the user accepted it.
#[derive(Debug, Clone, Copy)]
pub struct TakeoverConfirmed(());

impl TakeoverConfirmed {
    pub fn confirmed_by_user() -> Self {
        Self(())
    }
}

/// Owns one session's view of the soft lock on one document.
///
/// Every state transition runs under `transition`, so the heartbeat, the
/// presence subscription, takeover notices and user calls never interleave.
pub struct LockManager {
    document_id: Uuid,
    user_id: String,
    session_id: String,
    store: Arc<dyn DocumentStore>,
    channel: Arc<dyn ChangeChannel>,
    directory: Arc<dyn UserDirectory>,
    clock: Arc<dyn Clock>,
    heartbeat_interval: Duration,
    stale_lock_after: Option<Duration>,
    status: watch::Sender<LockStatus>,
    notifier: Notifier,
    transition: Mutex<()>,
    closed: AtomicBool,
    heartbeat: StdMutex<Option<JoinHandle<()>>>,
    presence: StdMutex<Option<JoinHandle<()>>>,
}

impl LockManager {
    pub fn new(
        document_id: Uuid,
        user_id: String,
        session_id: String,
        collab: &Collaborators,
        notifier: Notifier,
    ) -> Self {
        let (status, _) = watch::channel(LockStatus::free());
        Self {
            document_id,
            user_id,
            session_id,
            store: collab.store.clone(),
            channel: collab.channel.clone(),
            directory: collab.directory.clone(),
            clock: collab.clock.clone(),
            heartbeat_interval: collab.settings.heartbeat_interval,
            stale_lock_after: collab.settings.stale_lock_after,
            status,
            notifier,
            transition: Mutex::new(()),
            closed: AtomicBool::new(false),
            heartbeat: StdMutex::new(None),
            presence: StdMutex::new(None),
        }
    }

    pub fn status(&self) -> LockStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> LockState {
        self.status.borrow().state.clone()
    }

    pub fn is_held_by_self(&self) -> bool {
        self.status.borrow().state.is_held_by_self()
    }

    pub fn watch(&self) -> watch::Receiver<LockStatus> {
        self.status.subscribe()
    }

    /// Mount-time check: take the lock when it is free or already ours,
    /// otherwise become a spectator of the current holder.
    pub async fn check_initial(self: &Arc<Self>) -> Result<LockState, CollabError> {
        let _guard = self.transition.lock().await;

        let row = self
            .store
            .get(self.document_id)
            .await?
            .ok_or(CollabError::DocumentNotFound(self.document_id))?;

        let now = self.clock.now();
        match LockState::classify(row.locked_by.as_deref(), &self.user_id) {
            LockState::HeldByOther { holder } if !self.is_stale(row.locked_at, now) => {
                info!("Document {} is being edited by {}", self.document_id, holder);
                self.enter_held_by_other(&holder, row.locked_at, false).await;
                Ok(self.state())
            }
            _ => self.acquire_locked().await,
        }
    }

    pub async fn acquire(self: &Arc<Self>) -> Result<LockState, CollabError> {
        let _guard = self.transition.lock().await;
        self.acquire_locked().await
    }

    /// Heartbeat. Returns whether the session still holds the lock; a no-op
    /// returning `false` unless the lock is held by this session.
    pub async fn refresh(self: &Arc<Self>) -> Result<bool, CollabError> {
        let _guard = self.transition.lock().await;
        if !self.is_held_by_self() {
            return Ok(false);
        }

        let now = self.clock.now();
        if self
            .store
            .touch_lock(self.document_id, &self.user_id, now)
            .await?
        {
            self.status.send_modify(|s| s.locked_at = Some(now));
            debug!("Heartbeat for document {} at {}", self.document_id, now);
            return Ok(true);
        }

        warn!("Heartbeat for document {} refused, lock has moved on", self.document_id);
        self.resync_locked().await?;
        Ok(self.is_held_by_self())
    }

    /// Clear the lock if this session holds it. Never touches someone
    /// else's lock.
    pub async fn release(&self) -> Result<bool, CollabError> {
        let _guard = self.transition.lock().await;
        if !self.is_held_by_self() {
            debug!("Release of document {} skipped, lock not held", self.document_id);
            return Ok(false);
        }

        let released = self
            .store
            .release_lock(self.document_id, &self.user_id)
            .await?;
        self.status.send_replace(LockStatus::free());
        if released {
            info!("Session {} released lock on document {}", self.session_id, self.document_id);
        } else {
            warn!("Lock on document {} was already taken when releasing", self.document_id);
        }
        Ok(released)
    }

    /// Take the lock from whoever holds it and tell them over the channel.
    pub async fn force_takeover(self: &Arc<Self>, _confirmed: TakeoverConfirmed) -> Result<(), CollabError> {
        let _guard = self.transition.lock().await;

        let now = self.clock.now();
        let previous = self
            .store
            .force_lock(self.document_id, &self.user_id, now)
            .await?;
        info!(
            "Session {} took over document {} from {:?}",
            self.session_id, self.document_id, previous
        );
        self.enter_held_by_self(Some(now));

        let envelope = Envelope {
            sender_id: self.session_id.clone(),
            document_id: self.document_id,
            message: ChannelMessage::Takeover(TakeoverNotice {
                new_holder: self.user_id.clone(),
                previous_holder: previous,
            }),
        };
        if let Err(e) = self.channel.publish(envelope).await {
            // The previous holder still learns through the presence subscription.
            warn!("Failed to announce takeover of document {}: {}", self.document_id, e);
        }
        Ok(())
    }

    /// Re-read the presence row and reconcile local state with it.
    pub async fn resync(self: &Arc<Self>) -> Result<(), CollabError> {
        let _guard = self.transition.lock().await;
        self.resync_locked().await
    }

    /// Apply a presence update delivered by the store subscription.
    pub async fn observe(self: &Arc<Self>, presence: Presence) -> Result<(), CollabError> {
        if presence.document_id != self.document_id {
            return Ok(());
        }
        let _guard = self.transition.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.apply_presence_locked(presence, false).await
    }

    /// Apply a takeover notice from the change channel. Only matters when it
    /// names this session's user as the one being replaced.
    pub async fn observe_takeover(self: &Arc<Self>, notice: &TakeoverNotice) -> Result<(), CollabError> {
        if notice.new_holder == self.user_id
            || notice.previous_holder.as_deref() != Some(self.user_id.as_str())
        {
            return Ok(());
        }
        let _guard = self.transition.lock().await;
        if self.closed.load(Ordering::SeqCst) || !self.is_held_by_self() {
            return Ok(());
        }
        self.resync_locked().await
    }

    /// Start applying presence updates from `rx` in the background.
    pub fn watch_presence(self: &Arc<Self>, mut rx: broadcast::Receiver<Presence>) {
        let weak = Arc::downgrade(self);
        let document_id = self.document_id;
        let task = tokio::spawn(async move {
            loop {
                let presence = match rx.recv().await {
                    Ok(presence) => Some(presence),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Presence listener for {} skipped {} updates", document_id, skipped);
                        None
                    }
                    Err(RecvError::Closed) => {
                        warn!("Presence subscription for {} closed, keeping last known lock state", document_id);
                        break;
                    }
                };
                let Some(manager) = weak.upgrade() else { break };
                let result = match presence {
                    Some(presence) => manager.observe(presence).await,
                    None => manager.resync().await,
                };
                if let Err(e) = result {
                    warn!("Failed to apply presence update for {}: {}", document_id, e);
                }
            }
        });

        let mut slot = self.presence.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
    }

    /// Stop background work. Later presence updates are ignored.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for slot in [&self.heartbeat, &self.presence] {
            if let Some(task) = slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
                task.abort();
            }
        }
    }

    async fn acquire_locked(self: &Arc<Self>) -> Result<LockState, CollabError> {
        let now = self.clock.now();
        let presence = self
            .store
            .try_lock(self.document_id, &self.user_id, now, self.stale_cutoff(now))
            .await?;

        match LockState::classify(presence.locked_by.as_deref(), &self.user_id) {
            LockState::HeldBySelf => self.enter_held_by_self(presence.locked_at),
            LockState::HeldByOther { holder } => {
                debug!("Acquire of document {} lost to {}", self.document_id, holder);
                let kicked = self.is_held_by_self();
                self.enter_held_by_other(&holder, presence.locked_at, kicked).await;
            }
            LockState::Free => {
                self.status.send_replace(LockStatus::free());
            }
        }
        Ok(self.state())
    }

    async fn resync_locked(self: &Arc<Self>) -> Result<(), CollabError> {
        let row = self
            .store
            .get(self.document_id)
            .await?
            .ok_or(CollabError::DocumentNotFound(self.document_id))?;
        self.apply_presence_locked(row.presence(), true).await
    }

    /// `from_row` is set when `presence` was just read from the store rather
    /// than delivered by the subscription, which may lag behind it.
    async fn apply_presence_locked(self: &Arc<Self>, presence: Presence, from_row: bool) -> Result<(), CollabError> {
        let previous = self.state();
        match LockState::classify(presence.locked_by.as_deref(), &self.user_id) {
            LockState::HeldBySelf if previous.is_held_by_self() => {
                if presence.locked_at.is_some() {
                    self.status.send_modify(|s| s.locked_at = presence.locked_at);
                }
            }
            LockState::HeldBySelf if from_row => self.enter_held_by_self(presence.locked_at),
            // Events can arrive late; only the row itself can promote us.
            LockState::HeldBySelf => return self.confirm_gain().await,
            LockState::HeldByOther { holder } => {
                if previous.holder() == Some(holder.as_str()) {
                    self.status.send_modify(|s| s.locked_at = presence.locked_at);
                    return Ok(());
                }
                if previous.is_held_by_self() {
                    // Likewise only the row can demote us.
                    return self.confirm_loss(presence.locked_at, holder).await;
                }
                self.enter_held_by_other(&holder, presence.locked_at, false).await;
            }
            LockState::Free => {
                if previous == LockState::Free {
                    return Ok(());
                }
                info!("Lock on document {} was freed", self.document_id);
                self.status.send_replace(LockStatus::free());
                self.notifier.send(Notice::LockFreed);
                self.acquire_locked().await?;
            }
        }
        Ok(())
    }

    async fn confirm_gain(self: &Arc<Self>) -> Result<(), CollabError> {
        let row = self
            .store
            .get(self.document_id)
            .await?
            .ok_or(CollabError::DocumentNotFound(self.document_id))?;

        if LockState::classify(row.locked_by.as_deref(), &self.user_id).is_held_by_self() {
            self.enter_held_by_self(row.locked_at);
        } else {
            debug!(
                "Stale presence event for {} ignored, row names {:?}",
                self.document_id, row.locked_by
            );
        }
        Ok(())
    }

    async fn confirm_loss(
        self: &Arc<Self>,
        reported_at: Option<DateTime<Utc>>,
        reported_holder: String,
    ) -> Result<(), CollabError> {
        let current = match self.store.get(self.document_id).await {
            Ok(Some(row)) => row.presence(),
            Ok(None) => return Err(CollabError::DocumentNotFound(self.document_id)),
            Err(e) => {
                warn!("Could not confirm lock loss on {}, trusting the event: {}", self.document_id, e);
                Presence {
                    document_id: self.document_id,
                    locked_by: Some(reported_holder),
                    locked_at: reported_at,
                }
            }
        };

        match LockState::classify(current.locked_by.as_deref(), &self.user_id) {
            LockState::HeldBySelf => {
                debug!("Stale presence event for {} ignored", self.document_id);
                Ok(())
            }
            LockState::HeldByOther { holder } => {
                self.enter_held_by_other(&holder, current.locked_at, true).await;
                Ok(())
            }
            LockState::Free => {
                self.status.send_replace(LockStatus::free());
                self.notifier.send(Notice::LockFreed);
                self.acquire_locked().await.map(|_| ())
            }
        }
    }

    fn enter_held_by_self(self: &Arc<Self>, locked_at: Option<DateTime<Utc>>) {
        let was_held = self.is_held_by_self();
        self.status.send_replace(LockStatus {
            state: LockState::HeldBySelf,
            holder: None,
            locked_at,
        });
        if !was_held {
            info!("Session {} holds the lock on document {}", self.session_id, self.document_id);
            self.notifier.send(Notice::LockAcquired);
        }
        self.start_heartbeat();
    }

    async fn enter_held_by_other(&self, holder: &str, locked_at: Option<DateTime<Utc>>, kicked: bool) {
        let profile = self.resolve(holder).await;
        self.status.send_replace(LockStatus {
            state: LockState::HeldByOther {
                holder: holder.to_string(),
            },
            holder: Some(profile.clone()),
            locked_at,
        });
        if kicked {
            warn!(
                "Session {} lost the lock on document {} to {}",
                self.session_id, self.document_id, holder
            );
            self.notifier.send(Notice::Kicked { by: profile });
        } else {
            self.notifier.send(Notice::HolderEditing { holder: profile });
        }
    }

    async fn resolve(&self, user_id: &str) -> UserProfile {
        match self.directory.resolve(user_id).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!("Could not resolve lock holder {}: {}", user_id, e);
                UserProfile::anonymous(user_id)
            }
        }
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let mut slot = self.heartbeat.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let weak = Arc::downgrade(self);
        let period = self.heartbeat_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                // First tick completes immediately.
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                match manager.refresh().await {
                    Ok(true) => {}
                    Ok(false) => {
                        // Re-checked under the slot lock so a concurrent
                        // re-acquire either sees this task or starts a new one.
                        let mut slot = manager.heartbeat.lock().unwrap_or_else(|e| e.into_inner());
                        if !manager.is_held_by_self() {
                            slot.take();
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Heartbeat for document {} failed: {}", manager.document_id, e);
                    }
                }
            }
        }));
    }

    fn stale_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let after = chrono::Duration::from_std(self.stale_lock_after?).ok()?;
        now.checked_sub_signed(after)
    }

    fn is_stale(&self, locked_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match (self.stale_cutoff(now), locked_at) {
            (Some(cutoff), Some(locked_at)) => locked_at < cutoff,
            _ => false,
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
