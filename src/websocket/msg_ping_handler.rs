use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

use crate::models::{PingMessage, PongMessage, ServerMessage};

/// Handle PingMessage
pub async fn handle_ping_message(
    ping_msg: &PingMessage,
    document_id: Uuid,
    sender: &Arc<Mutex<SplitSink<WebSocket, Message>>>,
) {
    debug!("Ping received for document {} from {:?}", document_id, ping_msg.session);

    // Reply with pong
    let pong = ServerMessage::Pong(PongMessage {
        date: Utc::now().to_rfc3339(),
    });
    let pong_msg = match serde_json::to_string(&pong) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to encode Pong message for document {}: {}", document_id, e);
            return;
        }
    };
    if sender.lock().await.send(Message::Text(pong_msg)).await.is_err() {
        error!("Failed to send Pong message for document {}", document_id);
    }
}
