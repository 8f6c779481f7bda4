//! Postgres-backed ledger store.
//!
//! ## Schema
//!
//! One row per `(tenant_id, key)`, enforced by the `idempotency_keys_tenant_key`
//! unique constraint. `expires_at` is indexed for the expiry sweep.
//!
//! ## Atomic claim
//!
//! `try_claim` is a single `INSERT ... ON CONFLICT DO UPDATE ... WHERE` statement:
//! it inserts a fresh row, or takes over a row that is `failed` or expired, and
//! returns nothing when a live row holds the key. There is no read-then-write
//! window for two requests with the same brand-new key to slip through.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | Result |
//! |------------|----------------------|--------|
//! | Database (unique violation) on claim | `23505` | `ClaimOutcome::Held` |
//! | Database (other) | Any other | `LedgerError::Unavailable` |
//! | PoolClosed / PoolTimedOut / Io | N/A | `LedgerError::Unavailable` |
//! | Row decode failure | N/A | `LedgerError::Corrupt` |

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use fieldsync_core::{IdempotencyKey, TenantId};

use crate::record::{IdempotencyRecord, NewClaim, RecordStatus, StoredResponse};
use crate::store::{ClaimOutcome, LedgerError, LedgerStore};

/// Postgres ledger store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    /// Create a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect to `database_url` and make sure the schema exists.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Create the ledger table and its indexes if missing.
    pub async fn migrate(&self) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS idempotency_keys (
                id              UUID PRIMARY KEY,
                tenant_id       UUID NOT NULL,
                key             TEXT NOT NULL,
                request_path    TEXT NOT NULL,
                body_hash       TEXT NOT NULL,
                status          TEXT NOT NULL,
                response_status INTEGER NULL,
                response_body   JSONB NULL,
                created_at      TIMESTAMPTZ NOT NULL,
                expires_at      TIMESTAMPTZ NOT NULL,
                CONSTRAINT idempotency_keys_tenant_key UNIQUE (tenant_id, key)
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_table", e))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idempotency_keys_expires_at
                ON idempotency_keys (expires_at)
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_index", e))?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[instrument(skip(self), fields(tenant_id = %tenant_id, key = %key), err)]
    async fn find(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT
                id,
                tenant_id,
                key,
                request_path,
                body_hash,
                status,
                response_status,
                response_body,
                created_at,
                expires_at
            FROM idempotency_keys
            WHERE tenant_id = $1 AND key = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(key.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find", e))?;

        row.map(|row| record_from_row(&row)).transpose()
    }

    #[instrument(skip(self, claim), fields(tenant_id = %claim.tenant_id, key = %claim.key), err)]
    async fn try_claim(&self, claim: &NewClaim) -> Result<ClaimOutcome, LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (
                id,
                tenant_id,
                key,
                request_path,
                body_hash,
                status,
                response_status,
                response_body,
                created_at,
                expires_at
            )
            VALUES ($1, $2, $3, $4, $5, 'processing', NULL, NULL, $6, $7)
            ON CONFLICT (tenant_id, key) DO UPDATE SET
                id = EXCLUDED.id,
                request_path = EXCLUDED.request_path,
                body_hash = EXCLUDED.body_hash,
                status = 'processing',
                response_status = NULL,
                response_body = NULL,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            WHERE idempotency_keys.status = 'failed'
               OR idempotency_keys.expires_at <= EXCLUDED.created_at
            RETURNING id
            "#,
        )
        .bind(claim.id)
        .bind(claim.tenant_id.as_uuid())
        .bind(claim.key.as_str())
        .bind(&claim.request_path)
        .bind(&claim.body_hash)
        .bind(claim.created_at)
        .bind(claim.expires_at)
        .fetch_optional(&*self.pool)
        .await;

        match result {
            Ok(Some(_)) => Ok(ClaimOutcome::Claimed),
            Ok(None) => Ok(ClaimOutcome::Held),
            Err(e) if is_unique_violation(&e) => Ok(ClaimOutcome::Held),
            Err(e) => Err(map_sqlx_error("try_claim", e)),
        }
    }

    #[instrument(skip(self, response), fields(tenant_id = %tenant_id, key = %key), err)]
    async fn complete(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
        claim_id: Uuid,
        response: &StoredResponse,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET status = 'completed',
                response_status = $4,
                response_body = $5,
                expires_at = $6
            WHERE tenant_id = $1
              AND key = $2
              AND id = $3
              AND status = 'processing'
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(key.as_str())
        .bind(claim_id)
        .bind(response.status as i32)
        .bind(&response.body)
        .bind(expires_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, key = %key), err)]
    async fn fail(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
        claim_id: Uuid,
    ) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET status = 'failed'
            WHERE tenant_id = $1
              AND key = $2
              AND id = $3
              AND status = 'processing'
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(key.as_str())
        .bind(claim_id)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, LedgerError> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= $1")
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_expired", e))?;

        Ok(result.rows_affected())
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<IdempotencyRecord, LedgerError> {
    let corrupt = |e: sqlx::Error| LedgerError::Corrupt(e.to_string());

    let tenant: Uuid = row.try_get("tenant_id").map_err(corrupt)?;
    let key: String = row.try_get("key").map_err(corrupt)?;
    let key = IdempotencyKey::new(key).map_err(|e| LedgerError::Corrupt(e.to_string()))?;

    let status: String = row.try_get("status").map_err(corrupt)?;
    let status = RecordStatus::parse(&status)
        .ok_or_else(|| LedgerError::Corrupt(format!("unknown ledger status '{status}'")))?;

    let response_status: Option<i32> = row.try_get("response_status").map_err(corrupt)?;
    let response_body: Option<serde_json::Value> = row.try_get("response_body").map_err(corrupt)?;
    let response = match (response_status, response_body) {
        (Some(code), Some(body)) => {
            let code = u16::try_from(code)
                .map_err(|_| LedgerError::Corrupt(format!("invalid response status {code}")))?;
            Some(StoredResponse::new(code, body))
        }
        _ => None,
    };

    Ok(IdempotencyRecord {
        id: row.try_get("id").map_err(corrupt)?,
        tenant_id: TenantId::from_uuid(tenant),
        key,
        request_path: row.try_get("request_path").map_err(corrupt)?,
        body_hash: row.try_get("body_hash").map_err(corrupt)?,
        status,
        response,
        created_at: row.try_get("created_at").map_err(corrupt)?,
        expires_at: row.try_get("expires_at").map_err(corrupt)?,
    })
}

/// Map a SQLx error to a ledger error.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => LedgerError::Unavailable(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            LedgerError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            LedgerError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            LedgerError::Corrupt(format!("decode error in {}: {}", operation, err))
        }
        _ => LedgerError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
