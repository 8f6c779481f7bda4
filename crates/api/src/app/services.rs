use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use fieldsync_core::{ClientId, EntityId, MutationEnvelope, TenantId};
use fieldsync_ledger::{
    IdempotencyLedger, InMemoryLedgerStore, LedgerConfig, LedgerError, LedgerStore,
    PostgresLedgerStore,
};

use crate::config::ServerConfig;

/// Ledger store shared by the router and the expiry sweeper.
pub type SharedLedgerStore = Arc<dyn LedgerStore>;

const POSTGRES_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("storage failure: {0}")]
    Storage(String),
}

/// Current server-side state of one reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub entity_id: EntityId,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub client_id: ClientId,
}

impl Reading {
    fn from_envelope(envelope: &MutationEnvelope) -> Self {
        Self {
            entity_id: envelope.entity_id.clone(),
            payload: envelope.payload.clone(),
            attachment_url: envelope.attachment_url.clone(),
            updated_at: envelope.updated_at,
            client_id: envelope.client_id,
        }
    }

    /// Last-write-wins order: newer `updated_at` wins, client id breaks ties.
    fn is_superseded_by(&self, incoming: &MutationEnvelope) -> bool {
        (incoming.updated_at, incoming.client_id.as_uuid())
            > (self.updated_at, self.client_id.as_uuid())
    }
}

/// Effect of applying a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    /// The stored reading is at least as new; nothing changed.
    Stale,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Created => "created",
            ApplyOutcome::Updated => "updated",
            ApplyOutcome::Stale => "stale",
        }
    }
}

/// Tenant-scoped reading table with last-write-wins replacement.
#[derive(Debug, Default)]
pub struct ReadingStore {
    readings: Mutex<HashMap<(TenantId, EntityId), Reading>>,
    applications: AtomicU64,
}

impl ReadingStore {
    pub fn apply(
        &self,
        tenant_id: TenantId,
        envelope: &MutationEnvelope,
    ) -> Result<ApplyOutcome, ApplyError> {
        self.applications.fetch_add(1, Ordering::SeqCst);

        let mut readings = self
            .readings
            .lock()
            .map_err(|_| ApplyError::Storage("reading store lock poisoned".to_string()))?;

        let slot = (tenant_id, envelope.entity_id.clone());
        let outcome = match readings.get(&slot) {
            None => ApplyOutcome::Created,
            Some(existing) if existing.is_superseded_by(envelope) => ApplyOutcome::Updated,
            Some(_) => ApplyOutcome::Stale,
        };
        if outcome != ApplyOutcome::Stale {
            readings.insert(slot, Reading::from_envelope(envelope));
        }
        Ok(outcome)
    }

    pub fn get(&self, tenant_id: TenantId, entity_id: &EntityId) -> Option<Reading> {
        self.readings
            .lock()
            .ok()?
            .get(&(tenant_id, entity_id.clone()))
            .cloned()
    }

    /// How many times a submission was actually applied (replays excluded).
    pub fn applications(&self) -> u64 {
        self.applications.load(Ordering::SeqCst)
    }
}

/// Uploaded attachment bytes keyed by their storage path.
#[derive(Debug, Default)]
pub struct AttachmentStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl AttachmentStore {
    /// Store (or overwrite) the object at `path`.
    pub fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), ApplyError> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| ApplyError::Storage("attachment store lock poisoned".to_string()))?;
        objects.insert(path.to_string(), bytes);
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.lock().ok()?.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct AppServices {
    pub ledger: IdempotencyLedger<SharedLedgerStore>,
    pub readings: ReadingStore,
    pub attachments: AttachmentStore,
}

impl AppServices {
    pub fn in_memory(config: LedgerConfig) -> Self {
        Self::with_ledger_store(Arc::new(InMemoryLedgerStore::new()), config)
    }

    pub fn with_ledger_store(store: SharedLedgerStore, config: LedgerConfig) -> Self {
        Self {
            ledger: IdempotencyLedger::with_config(store, config),
            readings: ReadingStore::default(),
            attachments: AttachmentStore::default(),
        }
    }

    /// Postgres-backed ledger when `DATABASE_URL` is configured, in-memory otherwise.
    pub async fn from_config(config: &ServerConfig) -> Result<Self, LedgerError> {
        let store: SharedLedgerStore = match &config.database_url {
            Some(url) => {
                info!("using postgres idempotency ledger");
                Arc::new(PostgresLedgerStore::connect(url, POSTGRES_MAX_CONNECTIONS).await?)
            }
            None => {
                info!("DATABASE_URL not set; using in-memory idempotency ledger");
                Arc::new(InMemoryLedgerStore::new())
            }
        };
        Ok(Self::with_ledger_store(store, config.ledger.clone()))
    }

    pub fn ledger_store(&self) -> SharedLedgerStore {
        self.ledger.store().clone()
    }
}
