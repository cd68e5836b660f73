use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use super::{ChangeChannel, Envelope};
use crate::error::ChannelError;

/// In-process broadcast hub with one `tokio::sync::broadcast` channel per
/// document. Backs the relay server and same-process sessions.
pub struct ChannelHub {
    documents: RwLock<HashMap<Uuid, broadcast::Sender<Envelope>>>,
    capacity: usize,
}

impl ChannelHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Get or create the broadcast channel for a document
    async fn channel(&self, document_id: Uuid) -> broadcast::Sender<Envelope> {
        if let Some(bc) = self.documents.read().await.get(&document_id) {
            return bc.clone();
        }
        let mut documents = self.documents.write().await;
        documents
            .entry(document_id)
            .or_insert_with(|| {
                debug!("Opening broadcast channel for document {}", document_id);
                let (bc, _rx) = broadcast::channel::<Envelope>(self.capacity);
                bc
            })
            .clone()
    }

    /// Drop the channel of a document nobody listens to anymore.
    pub async fn prune(&self, document_id: Uuid) {
        let mut documents = self.documents.write().await;
        if documents
            .get(&document_id)
            .is_some_and(|bc| bc.receiver_count() == 0)
        {
            documents.remove(&document_id);
            info!("Closed broadcast channel for document {}", document_id);
        }
    }

    /// Number of open document channels.
    pub async fn channel_count(&self) -> usize {
        self.documents.read().await.len()
    }

    /// Total subscribers across all document channels.
    pub async fn subscriber_count(&self) -> usize {
        self.documents
            .read()
            .await
            .values()
            .map(|bc| bc.receiver_count())
            .sum()
    }
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl ChangeChannel for ChannelHub {
    async fn publish(&self, envelope: Envelope) -> Result<(), ChannelError> {
        let bc = self.channel(envelope.document_id).await;
        // Best-effort: with no subscribers the message is simply dropped.
        if bc.send(envelope).is_err() {
            debug!("Broadcast dropped, no subscribers");
        }
        Ok(())
    }

    async fn subscribe(&self, document_id: Uuid) -> Result<broadcast::Receiver<Envelope>, ChannelError> {
        Ok(self.channel(document_id).await.subscribe())
    }
}
