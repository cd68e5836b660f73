use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use crate::clients::UserDirectory;
use crate::db::DocumentStore;
use crate::ws::ChannelHub;

/// Shared state of the relay server
pub struct AppState {
    pub hub: Arc<ChannelHub>,
    pub store: Arc<dyn DocumentStore>,
    pub directory: Arc<dyn UserDirectory>,
    /// "postgres" or "memory"
    pub store_kind: &'static str,
    /// Open `/ws` connections
    pub relay_connections: AtomicU32,
}

impl AppState {
    pub fn new(
        hub: Arc<ChannelHub>,
        store: Arc<dyn DocumentStore>,
        directory: Arc<dyn UserDirectory>,
        store_kind: &'static str,
    ) -> Self {
        Self {
            hub,
            store,
            directory,
            store_kind,
            relay_connections: AtomicU32::new(0),
        }
    }
}
