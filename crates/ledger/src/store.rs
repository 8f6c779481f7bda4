//! Ledger storage boundary.
//!
//! A store holds at most one record per `(tenant_id, key)`. The only write
//! that creates records is [`LedgerStore::try_claim`], which must be atomic:
//! two concurrent claims for the same fresh key cannot both succeed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use fieldsync_core::{IdempotencyKey, TenantId};

use crate::record::{IdempotencyRecord, NewClaim, StoredResponse};

/// Ledger storage error.
///
/// Every variant means "the ledger cannot be trusted right now"; callers
/// degrade to non-deduplicated execution rather than rejecting writes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
}

/// Result of an attempt to claim a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The claim created (or took over) the record; the caller must run the handler.
    Claimed,
    /// A live record already holds the key.
    Held,
}

/// Idempotency ledger persistence.
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    /// Look up the record for a key, expired or not.
    async fn find(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, LedgerError>;

    /// Atomically insert a `processing` record, or replace an existing record
    /// that is `failed` or expired as of `claim.created_at`.
    async fn try_claim(&self, claim: &NewClaim) -> Result<ClaimOutcome, LedgerError>;

    /// Mark the claim `completed` with its response. Returns `false` when the
    /// claim no longer owns the record.
    async fn complete(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
        claim_id: Uuid,
        response: &StoredResponse,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, LedgerError>;

    /// Mark the claim `failed`. Returns `false` when the claim no longer owns the record.
    async fn fail(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
        claim_id: Uuid,
    ) -> Result<bool, LedgerError>;

    /// Physically delete records that expired before `now`. Returns the number removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, LedgerError>;
}

#[async_trait::async_trait]
impl<S: LedgerStore + ?Sized> LedgerStore for Arc<S> {
    async fn find(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, LedgerError> {
        (**self).find(tenant_id, key).await
    }

    async fn try_claim(&self, claim: &NewClaim) -> Result<ClaimOutcome, LedgerError> {
        (**self).try_claim(claim).await
    }

    async fn complete(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
        claim_id: Uuid,
        response: &StoredResponse,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        (**self)
            .complete(tenant_id, key, claim_id, response, expires_at)
            .await
    }

    async fn fail(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
        claim_id: Uuid,
    ) -> Result<bool, LedgerError> {
        (**self).fail(tenant_id, key, claim_id).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, LedgerError> {
        (**self).purge_expired(now).await
    }
}
