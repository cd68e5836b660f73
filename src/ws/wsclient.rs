use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{ChangeChannel, Envelope};
use crate::error::ChannelError;
use crate::models::{ClientMessage, PublishMessage, ServerMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const RECONNECT_INITIAL: Duration = Duration::from_millis(250);
const RECONNECT_MAX: Duration = Duration::from_secs(10);

struct Connection {
    // `None` while the socket is down and being reopened.
    sink: Arc<Mutex<Option<WsSink>>>,
    incoming: broadcast::Sender<Envelope>,
    supervisor: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

/// Change channel backed by the relay server's `/ws/{doc_id}` endpoint.
///
/// One socket per document, opened on first use. When the relay drops it, a
/// background task reopens it with exponential backoff; subscribers keep
/// their receiver across reconnects. Messages relayed while disconnected are
/// lost, the writer's next snapshot carries the whole content anyway.
pub struct WsChangeChannel {
    base_url: String,
    capacity: usize,
    connections: Mutex<HashMap<Uuid, Arc<Connection>>>,
}

impl WsChangeChannel {
    /// `base_url` is the relay root, e.g. `ws://localhost:3000`.
    pub fn new(base_url: impl Into<String>, capacity: usize) -> Self {
        Self {
            base_url: base_url.into(),
            capacity: capacity.max(1),
            connections: Mutex::new(HashMap::new()),
        }
    }

    fn document_url(&self, document_id: Uuid) -> String {
        format!("{}/ws/{}", self.base_url.trim_end_matches('/'), document_id)
    }

    async fn connection(&self, document_id: Uuid) -> Result<Arc<Connection>, ChannelError> {
        let mut connections = self.connections.lock().await;
        if let Some(conn) = connections.get(&document_id) {
            return Ok(conn.clone());
        }

        let url = self.document_url(document_id);
        let (stream, _) = connect_async(url.as_str()).await?;
        info!("Connected to relay at {}", url);

        let (sink, source) = stream.split();
        let sink = Arc::new(Mutex::new(Some(sink)));
        let incoming = broadcast::channel(self.capacity).0;
        let supervisor = tokio::spawn(maintain(
            url,
            document_id,
            source,
            sink.clone(),
            incoming.clone(),
        ));

        let conn = Arc::new(Connection {
            sink,
            incoming,
            supervisor,
        });
        connections.insert(document_id, conn.clone());
        Ok(conn)
    }
}

/// Read relay frames, and reopen the socket whenever it goes away.
async fn maintain(
    url: String,
    document_id: Uuid,
    mut source: WsSource,
    sink: Arc<Mutex<Option<WsSink>>>,
    incoming: broadcast::Sender<Envelope>,
) {
    loop {
        read_frames(document_id, &mut source, &incoming).await;
        sink.lock().await.take();
        warn!("Relay connection for document {} lost, reconnecting", document_id);

        let mut backoff = RECONNECT_INITIAL;
        source = loop {
            tokio::time::sleep(backoff).await;
            match connect_async(url.as_str()).await {
                Ok((stream, _)) => {
                    let (new_sink, new_source) = stream.split();
                    *sink.lock().await = Some(new_sink);
                    info!("Reconnected to relay at {}", url);
                    break new_source;
                }
                Err(e) => {
                    debug!("Reconnect to {} failed, retrying in {:?}: {}", url, backoff, e);
                    backoff = (backoff * 2).min(RECONNECT_MAX);
                }
            }
        };
    }
}

async fn read_frames(document_id: Uuid, source: &mut WsSource, incoming: &broadcast::Sender<Envelope>) {
    while let Some(frame) = source.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("Relay connection for document {} failed: {}", document_id, e);
                break;
            }
        };

        match serde_json::from_str::<ServerMessage>(&text) {
            Ok(ServerMessage::Message(relay)) => {
                let _ = incoming.send(relay.envelope);
            }
            Ok(ServerMessage::Presence(_)) | Ok(ServerMessage::Pong(_)) => {}
            Err(e) => error!("Failed to parse relay frame for document {}: {}", document_id, e),
        }
    }
}

#[async_trait]
impl ChangeChannel for WsChangeChannel {
    async fn publish(&self, envelope: Envelope) -> Result<(), ChannelError> {
        let document_id = envelope.document_id;
        let frame = serde_json::to_string(&ClientMessage::Publish(PublishMessage { envelope }))?;
        let conn = self.connection(document_id).await?;
        let mut sink = conn.sink.lock().await;
        let Some(socket) = sink.as_mut() else {
            return Err(ChannelError::Transport(format!(
                "relay connection for document {} is reconnecting",
                document_id
            )));
        };
        if let Err(e) = socket.send(Message::text(frame)).await {
            sink.take();
            return Err(e.into());
        }
        Ok(())
    }

    async fn subscribe(&self, document_id: Uuid) -> Result<broadcast::Receiver<Envelope>, ChannelError> {
        let conn = self.connection(document_id).await?;
        Ok(conn.incoming.subscribe())
    }
}
