//! Idempotent execution of a request handler.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use fieldsync_core::{IdempotencyKey, TenantId};

use crate::fingerprint::body_hash;
use crate::record::{NewClaim, RecordStatus, StoredResponse, add_saturating, to_chrono};
use crate::store::{ClaimOutcome, LedgerError, LedgerStore};

/// Ledger timing configuration.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// How long a completed response stays replayable.
    pub ttl: Duration,
    /// How long a `processing` claim holds its key before another request may take it over.
    pub processing_lease: Duration,
    /// How often a waiting request re-reads a `processing` record.
    pub poll_interval: Duration,
    /// Upper bound on waiting for a concurrent request with the same key.
    pub max_wait: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            processing_lease: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            max_wait: Duration::from_secs(5),
        }
    }
}

impl LedgerConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_processing_lease(mut self, lease: Duration) -> Self {
        self.processing_lease = lease;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }
}

/// How a request was answered.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The handler ran under a ledger claim and its response was recorded.
    Fresh(StoredResponse),
    /// A completed record matched; the handler did not run.
    Replayed(StoredResponse),
    /// The handler ran without deduplication (no key, or the ledger was unavailable).
    Bypassed(StoredResponse),
}

impl Outcome {
    pub fn response(&self) -> &StoredResponse {
        match self {
            Outcome::Fresh(r) | Outcome::Replayed(r) | Outcome::Bypassed(r) => r,
        }
    }

    pub fn into_response(self) -> StoredResponse {
        match self {
            Outcome::Fresh(r) | Outcome::Replayed(r) | Outcome::Bypassed(r) => r,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, Outcome::Replayed(_))
    }
}

/// Errors surfaced by [`IdempotencyLedger::idempotent`].
#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError<E> {
    /// The key was already used for a different request (path or body).
    #[error("idempotency key '{key}' was already used with a different request")]
    KeyReused { key: IdempotencyKey },

    /// Another request with the same key did not finish within `max_wait`.
    #[error("a request with idempotency key '{key}' is still being processed")]
    InProgress { key: IdempotencyKey },

    /// The handler itself failed; the key is released for a later attempt.
    #[error("{0}")]
    Handler(E),
}

/// Server-side dedup authority over a [`LedgerStore`].
#[derive(Debug, Clone)]
pub struct IdempotencyLedger<S> {
    store: S,
    config: LedgerConfig,
}

impl<S: LedgerStore> IdempotencyLedger<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, LedgerConfig::default())
    }

    pub fn with_config(store: S, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Run `handler` at most once per `(tenant_id, key)` within the TTL.
    ///
    /// - no key: the handler runs directly
    /// - completed record with the same path and body: its response is replayed
    /// - record with a different path or body: [`IdempotencyError::KeyReused`]
    /// - `processing` record: wait for it up to `max_wait`, then [`IdempotencyError::InProgress`]
    /// - absent, expired or failed record: claim the key, run the handler and record the result
    /// - store errors: the handler runs without deduplication
    ///
    /// Handler errors mark the claim `failed` so a later retry can run again.
    #[instrument(
        skip(self, body, handler),
        fields(tenant_id = %tenant_id, key = ?key.map(IdempotencyKey::as_str), path = request_path)
    )]
    pub async fn idempotent<F, Fut, E>(
        &self,
        tenant_id: TenantId,
        key: Option<&IdempotencyKey>,
        request_path: &str,
        body: &Value,
        handler: F,
    ) -> Result<Outcome, IdempotencyError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<StoredResponse, E>>,
    {
        let Some(key) = key else {
            return run_bypassed(handler).await;
        };

        let hash = body_hash(body);
        let deadline = Instant::now() + self.config.max_wait;

        let claim = loop {
            let now = Utc::now();
            let record = match self.store.find(tenant_id, key).await {
                Ok(record) => record,
                Err(e) => return self.degrade(e, handler).await,
            };

            match record {
                Some(record) if !record.is_claimable(now) => {
                    if !record.matches(request_path, &hash) {
                        debug!("idempotency key reused with a different request");
                        return Err(IdempotencyError::KeyReused { key: key.clone() });
                    }
                    if let (RecordStatus::Completed, Some(response)) =
                        (record.status, record.response)
                    {
                        debug!(status = response.status, "replaying recorded response");
                        return Ok(Outcome::Replayed(response));
                    }
                }
                _ => {
                    let claim = NewClaim::new(
                        tenant_id,
                        key.clone(),
                        request_path,
                        hash.clone(),
                        now,
                        to_chrono(self.config.processing_lease),
                    );
                    match self.store.try_claim(&claim).await {
                        Ok(ClaimOutcome::Claimed) => break claim,
                        Ok(ClaimOutcome::Held) => {
                            debug!("lost claim race; waiting for the current holder");
                        }
                        Err(e) => return self.degrade(e, handler).await,
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(IdempotencyError::InProgress { key: key.clone() });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        };

        match handler().await {
            Ok(response) => {
                let expires_at = add_saturating(claim.created_at, to_chrono(self.config.ttl));
                match self
                    .store
                    .complete(tenant_id, key, claim.id, &response, expires_at)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => warn!(
                        claim_id = %claim.id,
                        "claim was superseded before completion; response not recorded"
                    ),
                    Err(e) => warn!(error = %e, "failed to record response in idempotency ledger"),
                }
                Ok(Outcome::Fresh(response))
            }
            Err(e) => {
                match self.store.fail(tenant_id, key, claim.id).await {
                    Ok(_) => {}
                    Err(le) => warn!(error = %le, "failed to release idempotency claim"),
                }
                Err(IdempotencyError::Handler(e))
            }
        }
    }

    async fn degrade<F, Fut, E>(
        &self,
        error: LedgerError,
        handler: F,
    ) -> Result<Outcome, IdempotencyError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<StoredResponse, E>>,
    {
        warn!(error = %error, "idempotency ledger unavailable; executing without deduplication");
        run_bypassed(handler).await
    }
}

async fn run_bypassed<F, Fut, E>(handler: F) -> Result<Outcome, IdempotencyError<E>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<StoredResponse, E>>,
{
    handler()
        .await
        .map(Outcome::Bypassed)
        .map_err(IdempotencyError::Handler)
}
