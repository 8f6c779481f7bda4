//! In-memory ledger store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use fieldsync_core::{IdempotencyKey, TenantId};

use crate::record::{IdempotencyRecord, NewClaim, RecordStatus, StoredResponse};
use crate::store::{ClaimOutcome, LedgerError, LedgerStore};

type RecordKey = (TenantId, IdempotencyKey);

/// Mutex-guarded map; the mutex makes `try_claim` atomic.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    records: Mutex<HashMap<RecordKey, IdempotencyRecord>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of physically present records (expired ones included).
    pub fn len(&self) -> usize {
        self.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<RecordKey, IdempotencyRecord>>, LedgerError> {
        self.records
            .lock()
            .map_err(|_| LedgerError::Unavailable("in-memory ledger lock poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn find(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, LedgerError> {
        let records = self.lock()?;
        Ok(records.get(&(tenant_id, key.clone())).cloned())
    }

    async fn try_claim(&self, claim: &NewClaim) -> Result<ClaimOutcome, LedgerError> {
        let mut records = self.lock()?;
        let slot = (claim.tenant_id, claim.key.clone());

        let held = records
            .get(&slot)
            .is_some_and(|existing| !existing.is_claimable(claim.created_at));
        if held {
            return Ok(ClaimOutcome::Held);
        }

        records.insert(slot, claim.to_record());
        Ok(ClaimOutcome::Claimed)
    }

    async fn complete(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
        claim_id: Uuid,
        response: &StoredResponse,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let mut records = self.lock()?;
        match records.get_mut(&(tenant_id, key.clone())) {
            Some(record) if record.id == claim_id && record.status == RecordStatus::Processing => {
                record.status = RecordStatus::Completed;
                record.response = Some(response.clone());
                record.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
        claim_id: Uuid,
    ) -> Result<bool, LedgerError> {
        let mut records = self.lock()?;
        match records.get_mut(&(tenant_id, key.clone())) {
            Some(record) if record.id == claim_id && record.status == RecordStatus::Processing => {
                record.status = RecordStatus::Failed;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, LedgerError> {
        let mut records = self.lock()?;
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        Ok((before - records.len()) as u64)
    }
}
