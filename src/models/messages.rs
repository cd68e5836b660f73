use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::db::Presence;
use crate::ws::Envelope;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PublishMessage {
    pub envelope: Envelope,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PingMessage {
    pub session: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RelayMessage {
    pub envelope: Envelope,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    pub presence: Presence,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PongMessage {
    pub date: String,
}

/// Frames a session sends to the relay
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "publish")]
    Publish(PublishMessage),
    #[serde(rename = "ping")]
    Ping(PingMessage),
}

/// Frames the relay sends to a session
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "message")]
    Message(RelayMessage),
    #[serde(rename = "presence")]
    Presence(PresenceMessage),
    #[serde(rename = "pong")]
    Pong(PongMessage),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::{ChannelMessage, ContentSnapshot};
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn publish_frame_is_tagged_by_type() {
        let document_id = Uuid::new_v4();
        let frame = ClientMessage::Publish(PublishMessage {
            envelope: Envelope {
                sender_id: "s1".into(),
                document_id,
                message: ChannelMessage::Content(ContentSnapshot {
                    revision: 3,
                    author: "alice".into(),
                    content: json!({"text": "hello"}),
                }),
            },
        });

        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "publish");
        assert_eq!(value["envelope"]["senderId"], "s1");
        assert_eq!(value["envelope"]["message"]["kind"], "content");
        assert_eq!(value["envelope"]["message"]["revision"], 3);
    }

    #[test]
    fn ping_without_session_omits_the_field() {
        let text = serde_json::to_string(&ClientMessage::Ping(PingMessage { session: None })).unwrap();
        assert_eq!(text, r#"{"type":"ping"}"#);

        let parsed: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(parsed, ClientMessage::Ping(PingMessage { session: None })));
    }
}
