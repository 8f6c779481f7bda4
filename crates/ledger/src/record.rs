//! Idempotency record model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fieldsync_core::{IdempotencyKey, TenantId};

/// Lifecycle state of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// A request holding the key is executing its handler.
    Processing,
    /// The handler finished; the captured response is replayable.
    Completed,
    /// The handler failed; the key may be claimed again.
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Processing => "processing",
            RecordStatus::Completed => "completed",
            RecordStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(RecordStatus::Processing),
            "completed" => Some(RecordStatus::Completed),
            "failed" => Some(RecordStatus::Failed),
            _ => None,
        }
    }
}

/// HTTP response captured from a handler so it can be replayed verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl StoredResponse {
    pub fn new(status: u16, body: serde_json::Value) -> Self {
        Self { status, body }
    }
}

/// A ledger entry, unique per `(tenant_id, key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Identifies one claim of the key; a superseded claim cannot complete.
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub key: IdempotencyKey,
    pub request_path: String,
    pub body_hash: String,
    pub status: RecordStatus,
    /// Present once `status == Completed`.
    pub response: Option<StoredResponse>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Entries past `expires_at` are treated as absent, whether or not they
    /// have been physically swept yet.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True when the request is the same logical request that created this record.
    pub fn matches(&self, request_path: &str, body_hash: &str) -> bool {
        self.request_path == request_path && self.body_hash == body_hash
    }

    /// Whether a new claim may replace this record.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == RecordStatus::Failed || self.is_expired(now)
    }
}

/// A request to create (or take over) the `processing` entry for a key.
#[derive(Debug, Clone, PartialEq)]
pub struct NewClaim {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub key: IdempotencyKey,
    pub request_path: String,
    pub body_hash: String,
    pub created_at: DateTime<Utc>,
    /// End of the processing lease.
    pub expires_at: DateTime<Utc>,
}

impl NewClaim {
    pub fn new(
        tenant_id: TenantId,
        key: IdempotencyKey,
        request_path: impl Into<String>,
        body_hash: impl Into<String>,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id,
            key,
            request_path: request_path.into(),
            body_hash: body_hash.into(),
            created_at: now,
            expires_at: add_saturating(now, lease),
        }
    }

    /// The record this claim materializes as.
    pub fn to_record(&self) -> IdempotencyRecord {
        IdempotencyRecord {
            id: self.id,
            tenant_id: self.tenant_id,
            key: self.key.clone(),
            request_path: self.request_path.clone(),
            body_hash: self.body_hash.clone(),
            status: RecordStatus::Processing,
            response: None,
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}

/// `at + delta`, clamped instead of overflowing.
pub(crate) fn add_saturating(at: DateTime<Utc>, delta: chrono::Duration) -> DateTime<Utc> {
    at.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Convert a std duration into chrono, clamping absurdly large values.
pub(crate) fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}
