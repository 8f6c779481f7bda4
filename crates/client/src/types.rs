//! Queue and progress types shared across the client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use fieldsync_core::{EntityId, IdempotencyKey, TenantId};

/// Local sequence number of a queued mutation.
pub type QueueId = i64;

/// A mutation to record locally, before it has a queue id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMutation {
    pub tenant_id: TenantId,
    pub entity_id: EntityId,
    pub payload: Value,
    /// Name of a blob in the local blob store to upload alongside the mutation.
    pub attachment_ref: Option<String>,
    /// Generated at enqueue time when absent.
    pub idempotency_key: Option<IdempotencyKey>,
}

impl NewMutation {
    pub fn new(tenant_id: TenantId, entity_id: EntityId, payload: Value) -> Self {
        Self {
            tenant_id,
            entity_id,
            payload,
            attachment_ref: None,
            idempotency_key: None,
        }
    }

    pub fn with_attachment(mut self, attachment_ref: impl Into<String>) -> Self {
        self.attachment_ref = Some(attachment_ref.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }
}

/// A mutation persisted in the durable queue.
///
/// `idempotency_key` never changes once the item is enqueued; every retry of
/// the mutation is sent under the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: QueueId,
    pub tenant_id: TenantId,
    pub entity_id: EntityId,
    pub payload: Value,
    pub idempotency_key: IdempotencyKey,
    pub attachment_ref: Option<String>,
    pub synced: bool,
    pub retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Counters for one `sync()` run, published after every batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    /// Pending items found when the run started.
    pub total: usize,
    /// Items confirmed by the server and removed from the queue.
    pub synced: usize,
    /// Items dropped after a permanent failure.
    pub failed: usize,
    /// Items left pending with an incremented retry count.
    pub retrying: usize,
}

impl SyncProgress {
    /// Items that reached a terminal or retry state in this run.
    pub fn processed(&self) -> usize {
        self.synced + self.failed + self.retrying
    }
}
