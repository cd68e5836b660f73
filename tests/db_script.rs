//! Integration tests for `DbScript` against a real Postgres.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use script_collab::db::{DbScript, DocumentStore};
use script_collab::error::StoreError;
use serde_json::json;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

/// Whole seconds, so values survive the round trip through `timestamptz`.
fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, minute, 0).unwrap()
}

async fn store_with_doc(pool: PgPool) -> (DbScript, Uuid) {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO documents (id, content, updated_at) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(sqlx::types::Json(json!({"text": "FADE IN:"})))
        .bind(at(0))
        .execute(&pool)
        .await
        .unwrap();
    let store = DbScript::from_pool(pool, 16).await.unwrap();
    (store, id)
}

// --- try_lock ---

#[sqlx::test(migrations = "./migrations")]
async fn test_try_lock_only_claims_a_free_lock(pool: PgPool) {
    let (store, id) = store_with_doc(pool).await;

    let first = store.try_lock(id, "alice", at(1), None).await.unwrap();
    assert!(first.is_held_by("alice"));
    assert_eq!(first.locked_at, Some(at(1)));

    let second = store.try_lock(id, "bob", at(2), None).await.unwrap();
    assert!(second.is_held_by("alice"));
    assert_eq!(second.locked_at, Some(at(1)));

    let again = store.try_lock(id, "alice", at(3), None).await.unwrap();
    assert_eq!(again.locked_at, Some(at(3)));
}

#[sqlx::test(migrations = "./migrations")]
async fn test_try_lock_reclaims_a_stale_lock_only_past_the_cutoff(pool: PgPool) {
    let (store, id) = store_with_doc(pool).await;
    store.try_lock(id, "alice", at(0), None).await.unwrap();

    let fresh_cutoff = at(0) - ChronoDuration::minutes(5);
    let kept = store.try_lock(id, "bob", at(30), Some(fresh_cutoff)).await.unwrap();
    assert!(kept.is_held_by("alice"));

    let stale_cutoff = at(30) - ChronoDuration::minutes(5);
    let taken = store.try_lock(id, "bob", at(30), Some(stale_cutoff)).await.unwrap();
    assert!(taken.is_held_by("bob"));
}

#[sqlx::test(migrations = "./migrations")]
async fn test_try_lock_on_missing_document_fails(pool: PgPool) {
    let store = DbScript::from_pool(pool, 16).await.unwrap();
    let missing = Uuid::new_v4();

    assert!(store.get(missing).await.unwrap().is_none());
    assert!(matches!(
        store.try_lock(missing, "alice", at(1), None).await,
        Err(StoreError::DocumentNotFound(id)) if id == missing
    ));
    assert!(matches!(
        store.force_lock(missing, "alice", at(1)).await,
        Err(StoreError::DocumentNotFound(_))
    ));
}

// --- force_lock ---

#[sqlx::test(migrations = "./migrations")]
async fn test_force_lock_reports_the_previous_holder(pool: PgPool) {
    let (store, id) = store_with_doc(pool).await;

    assert_eq!(store.force_lock(id, "alice", at(1)).await.unwrap(), None);
    assert_eq!(
        store.force_lock(id, "bob", at(2)).await.unwrap().as_deref(),
        Some("alice")
    );

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.locked_by.as_deref(), Some("bob"));
    assert_eq!(row.locked_at, Some(at(2)));
}

// --- holder-only writes ---

#[sqlx::test(migrations = "./migrations")]
async fn test_only_the_holder_can_touch_release_or_save(pool: PgPool) {
    let (store, id) = store_with_doc(pool).await;
    store.try_lock(id, "alice", at(1), None).await.unwrap();

    assert!(!store.touch_lock(id, "bob", at(2)).await.unwrap());
    assert!(!store.release_lock(id, "bob").await.unwrap());
    assert!(!store.save_content(id, "bob", &json!({"text": "bob"}), at(2)).await.unwrap());

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.locked_at, Some(at(1)));
    assert_eq!(row.content, json!({"text": "FADE IN:"}));
    assert_eq!(row.updated_by, None);

    assert!(store.touch_lock(id, "alice", at(2)).await.unwrap());
    assert!(store.save_content(id, "alice", &json!({"text": "CUT TO:"}), at(3)).await.unwrap());

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.locked_at, Some(at(2)));
    assert_eq!(row.content, json!({"text": "CUT TO:"}));
    assert_eq!(row.updated_at, at(3));
    assert_eq!(row.updated_by.as_deref(), Some("alice"));

    assert!(store.release_lock(id, "alice").await.unwrap());
    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.locked_by, None);
    assert_eq!(row.locked_at, None);
}

// --- presence notifications ---

#[sqlx::test(migrations = "./migrations")]
async fn test_lock_changes_reach_subscribers(pool: PgPool) {
    let (store, id) = store_with_doc(pool).await;
    let mut rx = store.subscribe(id).await.unwrap();

    store.try_lock(id, "alice", at(1), None).await.unwrap();
    let presence = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(presence.document_id, id);
    assert!(presence.is_held_by("alice"));

    store.release_lock(id, "alice").await.unwrap();
    let presence = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(presence.locked_by, None);
}

#[sqlx::test(migrations = "./migrations")]
async fn test_content_saves_do_not_notify(pool: PgPool) {
    let (store, id) = store_with_doc(pool).await;
    let mut rx = store.subscribe(id).await.unwrap();
    store.try_lock(id, "alice", at(1), None).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();

    store.save_content(id, "alice", &json!({"text": "INT."}), at(2)).await.unwrap();

    assert!(tokio::time::timeout(Duration::from_millis(500), rx.recv()).await.is_err());
}
