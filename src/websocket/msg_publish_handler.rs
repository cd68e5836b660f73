use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::models::PublishMessage;
use crate::ws::{ChangeChannel, ChannelHub};

/// Handle PublishMessage: relay the envelope to every socket on the document.
pub async fn handle_publish_message(publish_msg: PublishMessage, document_id: Uuid, hub: &ChannelHub) {
    let envelope = publish_msg.envelope;
    if envelope.document_id != document_id {
        warn!(
            "Dropping envelope for document {} received on socket for {}",
            envelope.document_id, document_id
        );
        return;
    }

    debug!("Relaying message from {} on document {}", envelope.sender_id, document_id);
    if let Err(e) = hub.publish(envelope).await {
        error!("Failed to broadcast for {document_id}: {e}");
    }
}
