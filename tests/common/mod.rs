#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use script_collab::clients::{StaticUserDirectory, UserProfile};
use script_collab::clock::{Clock, ManualClock};
use script_collab::db::{DocumentRow, DocumentStore, MemoryDocumentStore};
use script_collab::session::{Collaborators, EditorSession, MemoryBuffer, Notice, SessionSettings};
use script_collab::ws::ChannelHub;

pub fn profile(user_id: &str, display_name: &str) -> UserProfile {
    UserProfile {
        user_id: user_id.to_string(),
        display_name: display_name.to_string(),
        avatar: Some(format!("https://avatars.local/{}.png", user_id)),
    }
}

pub struct Fixture {
    pub store: Arc<MemoryDocumentStore>,
    pub hub: Arc<ChannelHub>,
    pub clock: Arc<ManualClock>,
    pub collab: Collaborators,
    pub document_id: Uuid,
}

pub struct OpenSession {
    pub session: EditorSession,
    pub notices: UnboundedReceiver<Notice>,
    pub buffer: Arc<MemoryBuffer>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_settings(SessionSettings::default())
    }

    pub fn with_settings(settings: SessionSettings) -> Self {
        let store = Arc::new(MemoryDocumentStore::default());
        let hub = Arc::new(ChannelHub::default());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
        ));
        let directory = StaticUserDirectory::new([
            profile("alice", "Alice Martin"),
            profile("bob", "Bob Chen"),
        ]);

        let document_id = Uuid::new_v4();
        store.insert(DocumentRow::new(
            document_id,
            json!({"scenes": []}),
            clock.now(),
        ));

        let collab = Collaborators {
            store: store.clone(),
            channel: hub.clone(),
            directory: Arc::new(directory),
            clock: clock.clone(),
            settings,
        };

        Self {
            store,
            hub,
            clock,
            collab,
            document_id,
        }
    }

    pub async fn open(&self, user_id: &str) -> OpenSession {
        let row = self.row().await;
        let buffer = Arc::new(MemoryBuffer::new(row.content));
        let (session, notices) = EditorSession::open(&self.collab, self.document_id, user_id, buffer.clone())
            .await
            .unwrap();
        OpenSession {
            session,
            notices,
            buffer,
        }
    }

    pub async fn row(&self) -> DocumentRow {
        self.store.get(self.document_id).await.unwrap().unwrap()
    }

    /// Poll the store until `locked_by` matches.
    pub async fn eventually_locked_by(&self, expected: Option<&str>) -> bool {
        for _ in 0..200 {
            if self.row().await.locked_by.as_deref() == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }
}

/// Poll `check` while letting background tasks run.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

pub fn drain(notices: &mut UnboundedReceiver<Notice>) -> Vec<Notice> {
    let mut out = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        out.push(notice);
    }
    out
}

pub fn text(value: &str) -> Value {
    json!({"scenes": [{"text": value}]})
}
