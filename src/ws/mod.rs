//! Per-document broadcast channel carrying live content and takeover notices.
//!
//! Delivery is at-most-once and unordered; receivers treat the newest
//! revision from a sender as authoritative. Every subscriber, the publisher
//! included, sees every message, so consumers filter on `sender_id`.

pub mod hub;
pub mod wsclient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::ChannelError;

pub use hub::ChannelHub;
pub use wsclient::WsChangeChannel;

/// The writer's in-progress content. Never persisted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContentSnapshot {
    /// Increases with every publish of the sending session.
    pub revision: u64,
    pub author: String,
    pub content: serde_json::Value,
}

/// Sent by a session right after it force-took the lock.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TakeoverNotice {
    pub new_holder: String,
    pub previous_holder: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ChannelMessage {
    Content(ContentSnapshot),
    Takeover(TakeoverNotice),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Session that published the message.
    pub sender_id: String,
    pub document_id: Uuid,
    pub message: ChannelMessage,
}

/// Publish/subscribe transport scoped to one document per topic.
#[async_trait]
pub trait ChangeChannel: Send + Sync {
    async fn publish(&self, envelope: Envelope) -> Result<(), ChannelError>;

    async fn subscribe(&self, document_id: Uuid) -> Result<broadcast::Receiver<Envelope>, ChannelError>;
}
