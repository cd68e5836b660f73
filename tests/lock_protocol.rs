mod common;

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;

use common::{drain, eventually, Fixture};
use script_collab::clock::Clock;
use script_collab::db::DocumentStore;
use script_collab::error::CollabError;
use script_collab::models::LockState;
use script_collab::session::{
    EditOutcome, EditorSession, LockManager, MemoryBuffer, Notice, Notifier, SessionSettings,
    TakeoverConfirmed,
};
use uuid::Uuid;

fn manager(fx: &Fixture, user_id: &str) -> (Arc<LockManager>, tokio::sync::mpsc::UnboundedReceiver<Notice>) {
    let (notifier, notices) = Notifier::channel();
    let manager = LockManager::new(
        fx.document_id,
        user_id.to_string(),
        format!("session-{}", user_id),
        &fx.collab,
        notifier,
    );
    (Arc::new(manager), notices)
}

#[tokio::test(start_paused = true)]
async fn only_one_of_two_sessions_holds_the_lock() {
    let fx = Fixture::new();

    let alice = fx.open("alice").await;
    let bob = fx.open("bob").await;

    assert_eq!(alice.session.lock_status().state, LockState::HeldBySelf);
    assert_eq!(
        bob.session.lock_status().state,
        LockState::HeldByOther { holder: "alice".into() }
    );
    assert_eq!(fx.row().await.locked_by.as_deref(), Some("alice"));
    assert!(!alice.session.is_read_only());
    assert!(bob.session.is_read_only());
}

#[tokio::test(start_paused = true)]
async fn spectator_sees_a_blocking_banner_naming_the_holder() {
    let fx = Fixture::new();
    let alice = fx.open("alice").await;
    let mut bob = fx.open("bob").await;

    assert!(alice.session.banner().is_none());

    let banner = bob.session.banner().unwrap();
    assert_eq!(banner.holder_id, "alice");
    assert_eq!(banner.display_name, "Alice Martin");
    assert!(banner.can_force_takeover);
    assert!(!banner.dismissible);

    let notices = drain(&mut bob.notices);
    assert!(matches!(
        notices.first(),
        Some(Notice::HolderEditing { holder }) if holder.user_id == "alice"
    ));
}

#[tokio::test(start_paused = true)]
async fn unknown_holder_falls_back_to_the_raw_user_id() {
    let fx = Fixture::new();
    fx.store
        .try_lock(fx.document_id, "carol", fx.clock.now(), None)
        .await
        .unwrap();

    let bob = fx.open("bob").await;
    let banner = bob.session.banner().unwrap();
    assert_eq!(banner.display_name, "carol");
    assert_eq!(banner.avatar, None);
}

#[tokio::test(start_paused = true)]
async fn refresh_and_release_do_nothing_for_a_spectator() {
    let fx = Fixture::new();
    let _alice = fx.open("alice").await;
    let before = fx.row().await;

    let (bob, _notices) = manager(&fx, "bob");
    bob.check_initial().await.unwrap();
    fx.clock.advance(ChronoDuration::seconds(30));

    assert!(!bob.refresh().await.unwrap());
    assert!(!bob.release().await.unwrap());

    let after = fx.row().await;
    assert_eq!(after.locked_by.as_deref(), Some("alice"));
    assert_eq!(after.locked_at, before.locked_at);
}

#[tokio::test(start_paused = true)]
async fn superseded_holder_is_refused_on_refresh_and_kicked() {
    let fx = Fixture::new();
    let (alice, mut notices) = manager(&fx, "alice");
    assert_eq!(alice.check_initial().await.unwrap(), LockState::HeldBySelf);

    // Bob takes over straight through the store; alice has no listener.
    fx.store
        .force_lock(fx.document_id, "bob", fx.clock.now())
        .await
        .unwrap();

    assert!(!alice.refresh().await.unwrap());
    assert_eq!(alice.state(), LockState::HeldByOther { holder: "bob".into() });
    assert_eq!(fx.row().await.locked_by.as_deref(), Some("bob"));

    let notices = drain(&mut notices);
    assert!(notices.contains(&Notice::LockAcquired));
    assert!(matches!(
        notices.last(),
        Some(Notice::Kicked { by }) if by.user_id == "bob"
    ));

    alice.shutdown();
}

#[tokio::test(start_paused = true)]
async fn heartbeat_keeps_the_lock_fresh() {
    let fx = Fixture::new();
    let start = fx.clock.now();
    let _alice = fx.open("alice").await;
    assert_eq!(fx.row().await.locked_at, Some(start));

    fx.clock.advance(ChronoDuration::seconds(60));
    tokio::time::sleep(Duration::from_secs(61)).await;

    assert_eq!(fx.row().await.locked_at, Some(start + ChronoDuration::seconds(60)));
}

#[tokio::test(start_paused = true)]
async fn forced_takeover_demotes_the_previous_holder() {
    let fx = Fixture::new();
    let mut alice = fx.open("alice").await;
    let bob = fx.open("bob").await;
    drain(&mut alice.notices);

    bob.session
        .force_takeover(TakeoverConfirmed::confirmed_by_user())
        .await
        .unwrap();

    assert_eq!(bob.session.lock_status().state, LockState::HeldBySelf);
    assert_eq!(fx.row().await.locked_by.as_deref(), Some("bob"));
    assert!(eventually(|| alice.session.is_read_only()).await);
    assert_eq!(
        alice.session.lock_status().state,
        LockState::HeldByOther { holder: "bob".into() }
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    let kicked: Vec<_> = drain(&mut alice.notices)
        .into_iter()
        .filter(|n| matches!(n, Notice::Kicked { .. }))
        .collect();
    assert_eq!(kicked.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn demoted_writer_stays_read_only_through_late_events() {
    let fx = Fixture::new();
    let mut alice = fx.open("alice").await;
    let bob = fx.open("bob").await;

    // Alice's heartbeat touches the row again right before the takeover.
    fx.clock.advance(ChronoDuration::seconds(60));
    tokio::time::sleep(Duration::from_secs(60)).await;
    drain(&mut alice.notices);

    bob.session
        .force_takeover(TakeoverConfirmed::confirmed_by_user())
        .await
        .unwrap();
    assert!(eventually(|| alice.session.is_read_only()).await);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let notices = drain(&mut alice.notices);
    assert!(!notices.contains(&Notice::LockAcquired));
    assert_eq!(
        alice.session.lock_status().state,
        LockState::HeldByOther { holder: "bob".into() }
    );
    assert_eq!(alice.session.edit(serde_json::json!({"text": "mine"})), EditOutcome::ReadOnly);
    assert_eq!(fx.row().await.locked_by.as_deref(), Some("bob"));
}

#[tokio::test(start_paused = true)]
async fn release_on_close_hands_the_lock_to_the_waiting_spectator() {
    let fx = Fixture::new();
    let alice = fx.open("alice").await;
    let mut bob = fx.open("bob").await;

    let mut closed = false;
    alice.session.close(|| closed = true).await.unwrap();
    assert!(closed);

    assert!(eventually(|| !bob.session.is_read_only()).await);
    assert!(fx.eventually_locked_by(Some("bob")).await);

    let notices = drain(&mut bob.notices);
    let freed = notices.iter().position(|n| *n == Notice::LockFreed);
    let acquired = notices.iter().position(|n| *n == Notice::LockAcquired);
    assert!(freed.is_some() && acquired.is_some());
    assert!(freed < acquired);
}

#[tokio::test(start_paused = true)]
async fn closing_a_spectator_leaves_the_lock_alone() {
    let fx = Fixture::new();
    let _alice = fx.open("alice").await;
    let bob = fx.open("bob").await;

    let mut closed = false;
    bob.session.close(|| closed = true).await.unwrap();

    assert!(closed);
    assert_eq!(fx.row().await.locked_by.as_deref(), Some("alice"));
}

#[tokio::test(start_paused = true)]
async fn dropping_a_session_releases_the_lock() {
    let fx = Fixture::new();
    let alice = fx.open("alice").await;
    assert_eq!(fx.row().await.locked_by.as_deref(), Some("alice"));

    drop(alice);

    assert!(fx.eventually_locked_by(None).await);
}

#[tokio::test(start_paused = true)]
async fn stale_locks_are_kept_unless_expiry_is_enabled() {
    let fx = Fixture::new();
    fx.store
        .try_lock(fx.document_id, "carol", fx.clock.now(), None)
        .await
        .unwrap();
    fx.clock.advance(ChronoDuration::minutes(10));

    let bob = fx.open("bob").await;
    assert_eq!(
        bob.session.lock_status().state,
        LockState::HeldByOther { holder: "carol".into() }
    );
    bob.session.close(|| {}).await.unwrap();

    let settings = SessionSettings {
        stale_lock_after: Some(Duration::from_secs(5 * 60)),
        ..SessionSettings::default()
    };
    let mut collab = fx.collab.clone();
    collab.settings = settings;
    let buffer = Arc::new(MemoryBuffer::new(fx.row().await.content));
    let (bob, _notices) = EditorSession::open(&collab, fx.document_id, "bob", buffer)
        .await
        .unwrap();

    assert_eq!(bob.lock_status().state, LockState::HeldBySelf);
    assert_eq!(fx.row().await.locked_by.as_deref(), Some("bob"));
}

#[tokio::test(start_paused = true)]
async fn opening_a_missing_document_fails() {
    let fx = Fixture::new();
    let buffer = Arc::new(MemoryBuffer::new(serde_json::json!({})));

    let result = EditorSession::open(&fx.collab, Uuid::new_v4(), "alice", buffer).await;

    assert!(matches!(result, Err(CollabError::DocumentNotFound(_))));
}
