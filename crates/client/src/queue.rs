//! Durable mutation queue persisted in SQLite.
//!
//! Every mutation recorded on the device lands in the `mutation_queue` table
//! before any network traffic happens. Rows are scoped by tenant, carry the
//! idempotency key they will be submitted under, and survive restarts: opening
//! the same file again yields the same pending set.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use fieldsync_core::{ClientId, EntityId, IdempotencyKey, TenantId};

use crate::types::{NewMutation, QueueId, QueueItem};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("failed to prepare queue directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt queue row {id}: {reason}")]
    Corrupt { id: QueueId, reason: String },

    #[error("queue item {0} not found")]
    NotFound(QueueId),
}

/// SQLite-backed mutation queue.
///
/// Cheap to clone and safe to share across tasks.
#[derive(Debug, Clone)]
pub struct MutationQueue {
    pool: SqlitePool,
}

impl MutationQueue {
    /// Open (creating if needed) the queue database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// Private in-memory database (tests/dev). Contents are lost on drop.
    pub async fn open_in_memory() -> Result<Self, QueueError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // One long-lived connection: every new in-memory connection is a fresh database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, QueueError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mutation_queue (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id        TEXT NOT NULL,
                entity_id        TEXT NOT NULL,
                payload          TEXT NOT NULL,
                idempotency_key  TEXT NOT NULL UNIQUE,
                attachment_ref   TEXT NULL,
                synced           INTEGER NOT NULL DEFAULT 0,
                retries          INTEGER NOT NULL DEFAULT 0,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS mutation_queue_tenant_synced
                ON mutation_queue (tenant_id, synced)
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS client_meta (
                key    TEXT PRIMARY KEY,
                value  TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Identity of this installation, created on first use and stable across
    /// restarts so that retried submissions keep an identical body.
    pub async fn client_id(&self) -> Result<ClientId, QueueError> {
        sqlx::query("INSERT OR IGNORE INTO client_meta (key, value) VALUES ('client_id', ?1)")
            .bind(ClientId::new().to_string())
            .execute(&self.pool)
            .await?;

        let raw: String =
            sqlx::query_scalar("SELECT value FROM client_meta WHERE key = 'client_id'")
                .fetch_one(&self.pool)
                .await?;

        raw.parse::<ClientId>().map_err(|e| QueueError::Corrupt {
            id: 0,
            reason: format!("client_id: {e}"),
        })
    }

    /// Record a mutation locally. Never touches the network.
    #[instrument(
        skip(self, mutation),
        fields(tenant_id = %mutation.tenant_id, entity_id = %mutation.entity_id)
    )]
    pub async fn enqueue(&self, mutation: NewMutation) -> Result<QueueItem, QueueError> {
        let key = mutation
            .idempotency_key
            .unwrap_or_else(IdempotencyKey::generate);
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO mutation_queue (
                tenant_id,
                entity_id,
                payload,
                idempotency_key,
                attachment_ref,
                synced,
                retries,
                created_at,
                updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, ?6, ?6)
            "#,
        )
        .bind(mutation.tenant_id.to_string())
        .bind(mutation.entity_id.as_str())
        .bind(mutation.payload.to_string())
        .bind(key.as_str())
        .bind(mutation.attachment_ref.as_deref())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        let item = QueueItem {
            id: result.last_insert_rowid(),
            tenant_id: mutation.tenant_id,
            entity_id: mutation.entity_id,
            payload: mutation.payload,
            idempotency_key: key,
            attachment_ref: mutation.attachment_ref,
            synced: false,
            retries: 0,
            created_at: now,
            updated_at: now,
        };
        debug!(id = item.id, key = %item.idempotency_key, "enqueued mutation");
        Ok(item)
    }

    /// Unsynced items of a tenant, oldest first.
    pub async fn list_pending(&self, tenant_id: TenantId) -> Result<Vec<QueueItem>, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT
                id,
                tenant_id,
                entity_id,
                payload,
                idempotency_key,
                attachment_ref,
                synced,
                retries,
                created_at,
                updated_at
            FROM mutation_queue
            WHERE tenant_id = ?1
              AND synced = 0
            ORDER BY id ASC
            "#,
        )
        .bind(tenant_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_item).collect()
    }

    pub async fn get(&self, id: QueueId) -> Result<Option<QueueItem>, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT
                id,
                tenant_id,
                entity_id,
                payload,
                idempotency_key,
                attachment_ref,
                synced,
                retries,
                created_at,
                updated_at
            FROM mutation_queue
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_item).transpose()
    }

    /// Flip `synced` to true. Returns `false` when the item was already synced
    /// (or is gone), so the flip happens exactly once.
    pub async fn mark_synced(&self, id: QueueId) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE mutation_queue
            SET synced = 1,
                updated_at = ?2
            WHERE id = ?1
              AND synced = 0
            "#,
        )
        .bind(id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Bump the retry counter of a pending item and return the new value.
    pub async fn increment_retry(&self, id: QueueId) -> Result<u32, QueueError> {
        let row = sqlx::query(
            r#"
            UPDATE mutation_queue
            SET retries = retries + 1,
                updated_at = ?2
            WHERE id = ?1
              AND synced = 0
            RETURNING retries
            "#,
        )
        .bind(id)
        .bind(Utc::now().to_rfc3339())
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or(QueueError::NotFound(id))?;
        let retries: i64 = row.try_get("retries")?;
        u32::try_from(retries).map_err(|_| QueueError::Corrupt {
            id,
            reason: format!("retry count {retries} out of range"),
        })
    }

    /// Drop a pending item that can no longer succeed.
    pub async fn delete_permanently_failed(&self, id: QueueId) -> Result<bool, QueueError> {
        let result = sqlx::query("DELETE FROM mutation_queue WHERE id = ?1 AND synced = 0")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove a synced item once its attachment has been cleaned up.
    pub async fn remove_synced(&self, id: QueueId) -> Result<bool, QueueError> {
        let result = sqlx::query("DELETE FROM mutation_queue WHERE id = ?1 AND synced = 1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove synced rows left behind by a crash between confirmation and
    /// cleanup. Returns the removed items so their attachments can be deleted.
    pub async fn purge_synced(&self, tenant_id: TenantId) -> Result<Vec<QueueItem>, QueueError> {
        let rows = sqlx::query(
            r#"
            DELETE FROM mutation_queue
            WHERE tenant_id = ?1
              AND synced = 1
            RETURNING
                id,
                tenant_id,
                entity_id,
                payload,
                idempotency_key,
                attachment_ref,
                synced,
                retries,
                created_at,
                updated_at
            "#,
        )
        .bind(tenant_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_item).collect()
    }

    pub async fn pending_count(&self, tenant_id: TenantId) -> Result<u64, QueueError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM mutation_queue WHERE tenant_id = ?1 AND synced = 0",
        )
        .bind(tenant_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }
}

/// Map a database row into a `QueueItem`.
fn row_to_item(row: &SqliteRow) -> Result<QueueItem, QueueError> {
    let id: QueueId = row.try_get("id")?;
    let corrupt = |reason: String| QueueError::Corrupt { id, reason };

    let tenant_str: String = row.try_get("tenant_id")?;
    let tenant_id = tenant_str
        .parse::<TenantId>()
        .map_err(|e| corrupt(format!("tenant_id: {e}")))?;

    let entity_str: String = row.try_get("entity_id")?;
    let entity_id = EntityId::new(entity_str).map_err(|e| corrupt(format!("entity_id: {e}")))?;

    let payload_str: String = row.try_get("payload")?;
    let payload: Value =
        serde_json::from_str(&payload_str).map_err(|e| corrupt(format!("payload: {e}")))?;

    let key_str: String = row.try_get("idempotency_key")?;
    let idempotency_key =
        IdempotencyKey::new(key_str).map_err(|e| corrupt(format!("idempotency_key: {e}")))?;

    let synced: i64 = row.try_get("synced")?;
    let retries: i64 = row.try_get("retries")?;
    let retries = u32::try_from(retries).map_err(|_| corrupt(format!("retries: {retries}")))?;

    Ok(QueueItem {
        id,
        tenant_id,
        entity_id,
        payload,
        idempotency_key,
        attachment_ref: row.try_get("attachment_ref")?,
        synced: synced != 0,
        retries,
        created_at: parse_timestamp(row, "created_at").map_err(corrupt)?,
        updated_at: parse_timestamp(row, "updated_at").map_err(corrupt)?,
    })
}

fn parse_timestamp(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, String> {
    let raw: String = row.try_get(column).map_err(|e| e.to_string())?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("{column}: {e}"))
}
