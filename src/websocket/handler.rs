use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::{ClientMessage, PresenceMessage, RelayMessage, ServerMessage};
use crate::state::AppState;
use crate::websocket::msg_ping_handler::handle_ping_message;
use crate::websocket::msg_publish_handler::handle_publish_message;
use crate::ws::ChangeChannel;

/// WebSocket handler
pub async fn websocket_handler(
    Path(document_id): Path<Uuid>,
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
) -> Response {
    info!("New WebSocket connection attempt for document {}", document_id);
    ws.on_upgrade(move |socket| handle_socket(socket, document_id, app_state))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, document_id: Uuid, app_state: Arc<AppState>) {
    let connection_id = Uuid::new_v4();
    app_state.relay_connections.fetch_add(1, Ordering::SeqCst);
    info!(
        "WebSocket connection established for document_id: {} with connection_id: {}",
        document_id, connection_id
    );

    let (sender, mut receiver) = socket.split();

    // Shared by the three tasks below
    let sender = Arc::new(tokio::sync::Mutex::new(sender));

    let mut relay_rx = match app_state.hub.subscribe(document_id).await {
        Ok(rx) => rx,
        Err(e) => {
            error!("Failed to open channel for document {}: {}", document_id, e);
            app_state.relay_connections.fetch_sub(1, Ordering::SeqCst);
            return;
        }
    };
    let mut presence_rx = match app_state.store.subscribe(document_id).await {
        Ok(rx) => Some(rx),
        Err(e) => {
            warn!("Presence updates unavailable for document {}: {}", document_id, e);
            None
        }
    };

    // Incoming frames from the session
    let inbound_sender = sender.clone();
    let inbound_state = app_state.clone();
    let mut inbound_task = tokio::spawn(async move {
        // Anything but a text frame ends the loop, including a close.
        while let Some(Ok(Message::Text(msg))) = receiver.next().await {
            let client_msg: ClientMessage = match serde_json::from_str(&msg) {
                Ok(client_msg) => client_msg,
                Err(e) => {
                    error!("Failed to parse message for document {}: {}", document_id, e);
                    continue;
                }
            };

            match client_msg {
                ClientMessage::Publish(publish_msg) => {
                    handle_publish_message(publish_msg, document_id, &inbound_state.hub).await;
                }
                ClientMessage::Ping(ping_msg) => {
                    handle_ping_message(&ping_msg, document_id, &inbound_sender).await;
                }
            }
        }
    });

    // Messages relayed from other sockets on the same document
    let relay_sender = sender.clone();
    let mut relay_task = tokio::spawn(async move {
        loop {
            let envelope = match relay_rx.recv().await {
                Ok(envelope) => envelope,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Connection {} lagged behind by {} messages", connection_id, skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let frame = match serde_json::to_string(&ServerMessage::Message(RelayMessage { envelope })) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Failed to encode relay frame for document {}: {}", document_id, e);
                    continue;
                }
            };
            if relay_sender.lock().await.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    // Lock changes of the document row
    let presence_sender = sender.clone();
    let mut presence_task = tokio::spawn(async move {
        let Some(rx) = presence_rx.as_mut() else {
            return std::future::pending::<()>().await;
        };
        loop {
            let presence = match rx.recv().await {
                Ok(presence) => presence,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            let frame = match serde_json::to_string(&ServerMessage::Presence(PresenceMessage { presence })) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Failed to encode presence frame for document {}: {}", document_id, e);
                    continue;
                }
            };
            if presence_sender.lock().await.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    // Wait for any task to finish and stop the others
    tokio::select! {
        _ = (&mut inbound_task) => {
            relay_task.abort();
            presence_task.abort();
        }
        _ = (&mut relay_task) => {
            inbound_task.abort();
            presence_task.abort();
        }
        _ = (&mut presence_task) => {
            debug!("Presence stream for document {} ended", document_id);
            inbound_task.abort();
            relay_task.abort();
        }
    };

    // An aborted task may still hold its receiver briefly; a channel missed
    // here is pruned when the next connection on the document closes.
    app_state.hub.prune(document_id).await;
    app_state.relay_connections.fetch_sub(1, Ordering::SeqCst);
    info!("WebSocket connection {} terminated", connection_id);
}
