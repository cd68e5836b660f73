use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{DocumentRow, DocumentStore, Presence};
use crate::error::StoreError;

/// Channel the `documents` trigger notifies on, payload is the document id.
pub const PRESENCE_CHANNEL: &str = "document_presence";

type Fanout = Arc<RwLock<HashMap<Uuid, broadcast::Sender<Presence>>>>;

/// Postgres-backed presence store
pub struct DbScript {
    pool: PgPool,
    fanout: Fanout,
    capacity: usize,
    listener: JoinHandle<()>,
}

impl DbScript {
    /// Connect, apply migrations and start listening for presence changes
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    /// * `capacity` - Per-document buffer of undelivered presence updates
    pub async fn connect(database_url: &str, capacity: usize) -> Result<Self, StoreError> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(database_url)
            .await?;

        info!("Database connection pool created successfully");

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Database migrations applied");

        Self::from_pool(pool, capacity).await
    }

    /// Wrap an already migrated pool and start listening for presence changes
    pub async fn from_pool(pool: PgPool, capacity: usize) -> Result<Self, StoreError> {
        let fanout: Fanout = Arc::new(RwLock::new(HashMap::new()));
        let mut listener = PgListener::connect_with(&pool).await?;
        listener.listen(PRESENCE_CHANNEL).await?;
        let listener = tokio::spawn(listen_presence(listener, pool.clone(), fanout.clone()));

        Ok(Self {
            pool,
            fanout,
            capacity: capacity.max(1),
            listener,
        })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn log_pool(&self, action: &str, document_id: Uuid) {
        let pool_idle = self.pool.num_idle() as u32;
        let pool_size = self.pool.size();
        debug!(
            "{} doc {}. Pool connections: {} idle, {} in use",
            action,
            document_id,
            pool_idle,
            pool_size.saturating_sub(pool_idle)
        );
    }
}

impl Drop for DbScript {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn fetch_presence(pool: &PgPool, document_id: Uuid) -> Result<Option<Presence>, sqlx::Error> {
    sqlx::query_as::<_, Presence>(
        r#"
            SELECT id, locked_by, locked_at
            FROM documents
            WHERE id = $1
        "#,
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await
}

/// Route `NOTIFY document_presence` payloads to the per-document subscribers.
async fn listen_presence(mut listener: PgListener, pool: PgPool, fanout: Fanout) {
    loop {
        let notification = match listener.recv().await {
            Ok(notification) => notification,
            Err(e) => {
                error!("Presence listener error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let document_id = match Uuid::parse_str(notification.payload()) {
            Ok(id) => id,
            Err(e) => {
                warn!("Ignoring presence notification '{}': {}", notification.payload(), e);
                continue;
            }
        };

        let sender = {
            let fanout = fanout.read().await;
            match fanout.get(&document_id) {
                Some(sender) if sender.receiver_count() > 0 => sender.clone(),
                _ => continue,
            }
        };

        match fetch_presence(&pool, document_id).await {
            Ok(Some(presence)) => {
                let _ = sender.send(presence);
            }
            Ok(None) => debug!("Presence changed for vanished document {}", document_id),
            Err(e) => error!("Failed to read presence for document {}: {}", document_id, e),
        }
    }
}

#[async_trait]
impl DocumentStore for DbScript {
    async fn get(&self, document_id: Uuid) -> Result<Option<DocumentRow>, StoreError> {
        self.log_pool("Loading", document_id);

        let row = sqlx::query_as::<_, DocumentRow>(
            r#"
                SELECT id, content, locked_by, locked_at, updated_at, updated_by
                FROM documents
                WHERE id = $1
            "#,
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn try_lock(
        &self,
        document_id: Uuid,
        user_id: &str,
        at: DateTime<Utc>,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<Presence, StoreError> {
        self.log_pool("Locking", document_id);

        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                error!(
                    "Failed to acquire connection from pool for document {}: {}. Pool state: {} idle, {} total",
                    document_id, e, self.pool.num_idle(), self.pool.size()
                );
                return Err(e.into());
            }
        };

        let claimed = sqlx::query_as::<_, Presence>(
            r#"
                UPDATE documents
                SET locked_by = $2,
                    locked_at = $3
                WHERE id = $1
                    AND (
                        locked_by IS NULL
                        OR locked_by = $2
                        OR ($4::timestamptz IS NOT NULL AND locked_at < $4)
                    )
                RETURNING id, locked_by, locked_at;
            "#,
        )
        .bind(document_id)
        .bind(user_id)
        .bind(at)
        .bind(stale_before)
        .fetch_optional(&mut *tx)
        .await?;

        let presence = match claimed {
            Some(presence) => presence,
            None => sqlx::query_as::<_, Presence>(
                r#"
                    SELECT id, locked_by, locked_at
                    FROM documents
                    WHERE id = $1
                "#,
            )
            .bind(document_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::DocumentNotFound(document_id))?,
        };

        tx.commit().await?;
        Ok(presence)
    }

    async fn force_lock(
        &self,
        document_id: Uuid,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError> {
        self.log_pool("Force locking", document_id);

        let previous = sqlx::query_scalar::<_, Option<String>>(
            r#"
                UPDATE documents d
                SET locked_by = $2,
                    locked_at = $3
                FROM (SELECT id, locked_by FROM documents WHERE id = $1 FOR UPDATE) prev
                WHERE d.id = prev.id
                RETURNING prev.locked_by;
            "#,
        )
        .bind(document_id)
        .bind(user_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        match previous {
            Some(previous) => {
                info!("Lock on document {} taken over by {} (was {:?})", document_id, user_id, previous);
                Ok(previous)
            }
            None => Err(StoreError::DocumentNotFound(document_id)),
        }
    }

    async fn touch_lock(
        &self,
        document_id: Uuid,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
                UPDATE documents
                SET locked_at = $3
                WHERE id = $1 AND locked_by = $2
            "#,
        )
        .bind(document_id)
        .bind(user_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, document_id: Uuid, user_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
                UPDATE documents
                SET locked_by = NULL,
                    locked_at = NULL
                WHERE id = $1 AND locked_by = $2
            "#,
        )
        .bind(document_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn save_content(
        &self,
        document_id: Uuid,
        user_id: &str,
        content: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.log_pool("Saving", document_id);

        let result = sqlx::query(
            r#"
                UPDATE documents
                SET content = $3,
                    updated_at = $4,
                    updated_by = $2
                WHERE id = $1 AND locked_by = $2
            "#,
        )
        .bind(document_id)
        .bind(user_id)
        .bind(Json(content))
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!("Content save for document {} by {} matched no locked row", document_id, user_id);
            return Ok(false);
        }
        Ok(true)
    }

    async fn subscribe(&self, document_id: Uuid) -> Result<broadcast::Receiver<Presence>, StoreError> {
        let mut fanout = self.fanout.write().await;
        fanout.retain(|_, sender| sender.receiver_count() > 0);
        let sender = fanout
            .entry(document_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(sender.subscribe())
    }
}
