//! Per-document editing session: soft lock, live content broadcast and
//! debounced autosave, bound together by [`EditorSession`].

pub mod autosave;
pub mod broadcaster;
pub mod buffer;
pub mod editor;
pub mod lock_manager;
pub mod notice;

use std::sync::Arc;
use std::time::Duration;

use crate::clients::UserDirectory;
use crate::clock::Clock;
use crate::db::DocumentStore;
use crate::ws::ChangeChannel;

pub use autosave::{AutosaveCoordinator, SaveOutcome, SaveStatus};
pub use broadcaster::ContentBroadcaster;
pub use buffer::{EditorBuffer, MemoryBuffer, Selection};
pub use editor::{EditOutcome, EditorSession, LockBanner};
pub use lock_manager::{LockManager, TakeoverConfirmed};
pub use notice::{Notice, Notifier};

/// Timing knobs of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub heartbeat_interval: Duration,
    pub autosave_debounce: Duration,
    pub broadcast_coalesce: Duration,
    /// Locks not refreshed for this long count as free on acquire. `None`
    /// keeps locks until they are released or taken over.
    pub stale_lock_after: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
            autosave_debounce: Duration::from_millis(1500),
            broadcast_coalesce: Duration::from_millis(50),
            stale_lock_after: None,
        }
    }
}

/// External collaborators shared by every session of a process.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn DocumentStore>,
    pub channel: Arc<dyn ChangeChannel>,
    pub directory: Arc<dyn UserDirectory>,
    pub clock: Arc<dyn Clock>,
    pub settings: SessionSettings,
}
