use tokio::sync::mpsc;
use tracing::debug;

use crate::clients::UserProfile;

/// User-facing notifications. Nothing else leaves a session.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// Someone else holds the lock; the session is a spectator.
    HolderEditing { holder: UserProfile },
    /// The lock was taken away while this session held it. Unsaved edits
    /// will not be persisted.
    Kicked { by: UserProfile },
    /// This session now holds the lock.
    LockAcquired,
    /// The lock was cleared by its previous holder.
    LockFreed,
    /// A save failed; the content stays pending and will be retried.
    SaveFailed { message: String },
}

/// Sending half of a session's notice stream.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Notice>,
}

impl Notifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, notice: Notice) {
        if self.tx.send(notice).is_err() {
            debug!("Notice dropped, shell stopped listening");
        }
    }
}
