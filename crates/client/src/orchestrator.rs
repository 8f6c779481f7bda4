//! Sync orchestrator.
//!
//! Drains the durable queue against the submission endpoint:
//! - One sync at a time per orchestrator; overlapping `sync()` calls join the
//!   in-flight run and receive its result
//! - Items are sent in batches, concurrently within a batch
//! - Every attempt waits out its backoff first and reuses the item's
//!   idempotency key, so the server applies each mutation at most once
//! - A 401 aborts the run and leaves unprocessed items untouched
//! - `cancel()` stops in-flight requests and pending retry waits

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use fieldsync_core::wire::codes;
use fieldsync_core::{ClientId, MutationEnvelope};

use crate::attachments::{AttachmentCoordinator, HttpAttachmentUploader, UploadError};
use crate::auth::{AuthProvider, AuthState};
use crate::blobs::{BlobStoreError, LocalBlobStore};
use crate::config::{ClientConfig, RejectionPolicy, SyncConfig};
use crate::error::SyncError;
use crate::queue::MutationQueue;
use crate::telemetry::{FailureCategory, SessionTelemetry};
use crate::timers::RetryTimers;
use crate::transport::{
    HttpSubmissionTransport, Submission, SubmissionResponse, SubmissionTransport, TransportError,
};
use crate::types::{QueueItem, SyncProgress};

type SharedOutcome = Shared<BoxFuture<'static, Result<SyncProgress, SyncError>>>;

/// How a server response moves an item through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Applied (now or earlier); confirm and clean up.
    Synced,
    /// Transient; retry while the budget allows.
    Retry(FailureCategory),
    /// The server will never accept this item.
    Reject(FailureCategory),
    /// Credentials rejected; abort the whole sync.
    Unauthorized,
}

/// Map a submission response to a disposition.
pub fn classify(response: &SubmissionResponse, policy: RejectionPolicy) -> Disposition {
    match response.status {
        200..=299 => Disposition::Synced,
        401 => Disposition::Unauthorized,
        409 if response.error_code() == Some(codes::IDEMPOTENCY_IN_PROGRESS) => {
            Disposition::Retry(FailureCategory::Conflict)
        }
        // The server holds a different body under this key; resending cannot help.
        409 if response.error_code() == Some(codes::IDEMPOTENCY_KEY_REUSED) => {
            Disposition::Reject(FailureCategory::Conflict)
        }
        409 => Disposition::Synced,
        408 => Disposition::Retry(FailureCategory::Timeout),
        429 => Disposition::Retry(FailureCategory::Server),
        500..=599 => Disposition::Retry(FailureCategory::Server),
        400..=499 => match policy {
            RejectionPolicy::FailFast => Disposition::Reject(FailureCategory::Unknown),
            RejectionPolicy::ExhaustRetries => Disposition::Retry(FailureCategory::Unknown),
        },
        _ => Disposition::Retry(FailureCategory::Unknown),
    }
}

fn transport_category(error: &TransportError) -> FailureCategory {
    match error {
        TransportError::Timeout => FailureCategory::Timeout,
        TransportError::InvalidResponse(_) => FailureCategory::Server,
        TransportError::Cancelled | TransportError::Network(_) => FailureCategory::Unknown,
    }
}

fn upload_category(error: &UploadError) -> FailureCategory {
    match error {
        UploadError::Rejected { status, .. } if *status >= 500 => FailureCategory::Server,
        UploadError::Rejected { .. } => FailureCategory::Unknown,
        UploadError::Transport(e) => transport_category(e),
        UploadError::Blob(_) => FailureCategory::Storage,
    }
}

/// Per-item result within one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Synced,
    Retrying,
    Failed,
    Unauthorized,
    /// Cancelled before a result could be applied; the item is untouched.
    Skipped,
}

/// Handle on a started (or joined) sync run.
pub struct SyncRun {
    outcome: SharedOutcome,
    progress: watch::Receiver<SyncProgress>,
    joined: bool,
}

impl SyncRun {
    /// Progress snapshots, updated after every batch.
    pub fn progress(&self) -> watch::Receiver<SyncProgress> {
        self.progress.clone()
    }

    /// `true` when this handle attached to a run that was already in flight.
    pub fn joined_existing(&self) -> bool {
        self.joined
    }

    pub async fn wait(self) -> Result<SyncProgress, SyncError> {
        self.outcome.await
    }
}

impl std::fmt::Debug for SyncRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncRun")
            .field("progress", &*self.progress.borrow())
            .field("joined", &self.joined)
            .finish_non_exhaustive()
    }
}

struct ActiveSync {
    id: u64,
    outcome: SharedOutcome,
    progress: watch::Receiver<SyncProgress>,
    cancel: CancellationToken,
}

struct Inner {
    queue: MutationQueue,
    auth: Arc<dyn AuthProvider>,
    transport: Arc<dyn SubmissionTransport>,
    attachments: Option<AttachmentCoordinator>,
    telemetry: Arc<SessionTelemetry>,
    timers: RetryTimers,
    config: SyncConfig,
    client_id: Option<ClientId>,
    active: Mutex<Option<ActiveSync>>,
    next_run: AtomicU64,
}

pub struct SyncOrchestratorBuilder {
    queue: MutationQueue,
    auth: Arc<dyn AuthProvider>,
    transport: Arc<dyn SubmissionTransport>,
    attachments: Option<AttachmentCoordinator>,
    telemetry: Arc<SessionTelemetry>,
    config: SyncConfig,
    client_id: Option<ClientId>,
}

impl SyncOrchestratorBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn attachments(mut self, attachments: AttachmentCoordinator) -> Self {
        self.attachments = Some(attachments);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<SessionTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Override the installation id (otherwise read from the queue database).
    pub fn client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    pub fn build(self) -> SyncOrchestrator {
        SyncOrchestrator {
            inner: Arc::new(Inner {
                queue: self.queue,
                auth: self.auth,
                transport: self.transport,
                attachments: self.attachments,
                telemetry: self.telemetry,
                timers: RetryTimers::new(),
                config: self.config,
                client_id: self.client_id,
                active: Mutex::new(None),
                next_run: AtomicU64::new(1),
            }),
        }
    }
}

/// Owns the queue's sync timeline. Cheap to clone; clones share the same
/// in-flight run.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    pub fn builder(
        queue: MutationQueue,
        auth: Arc<dyn AuthProvider>,
        transport: Arc<dyn SubmissionTransport>,
    ) -> SyncOrchestratorBuilder {
        SyncOrchestratorBuilder {
            queue,
            auth,
            transport,
            attachments: None,
            telemetry: Arc::new(SessionTelemetry::new()),
            config: SyncConfig::default(),
            client_id: None,
        }
    }

    /// Wire the SQLite queue, blob store and HTTP transport from `config`.
    pub async fn open(
        config: &ClientConfig,
        auth: Arc<dyn AuthProvider>,
    ) -> Result<Self, SyncError> {
        let queue = MutationQueue::open(config.queue_path()).await?;
        let blobs = LocalBlobStore::open(config.blob_dir())
            .await
            .map_err(|e: BlobStoreError| SyncError::Internal(e.to_string()))?;
        let transport = HttpSubmissionTransport::new(&config.api_url, config.request_timeout)
            .map_err(|e| SyncError::Internal(e.to_string()))?;
        let uploader = HttpAttachmentUploader::new(&config.api_url, config.request_timeout)
            .map_err(|e| SyncError::Internal(e.to_string()))?;

        Ok(Self::builder(queue, auth, Arc::new(transport))
            .config(config.sync.clone())
            .attachments(AttachmentCoordinator::new(blobs, Arc::new(uploader)))
            .build())
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.inner.queue
    }

    pub fn telemetry(&self) -> Arc<SessionTelemetry> {
        self.inner.telemetry.clone()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.active().is_some()
    }

    /// Start a sync, or join the one already in flight. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) -> SyncRun {
        let mut active = self.inner.active();
        if let Some(run) = active.as_ref() {
            debug!(run = run.id, "joining in-flight sync");
            return SyncRun {
                outcome: run.outcome.clone(),
                progress: run.progress.clone(),
                joined: true,
            };
        }

        let id = self.inner.next_run.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (progress_tx, progress_rx) = watch::channel(SyncProgress::default());

        let inner = self.inner.clone();
        let run_cancel = cancel.clone();
        let task = tokio::spawn(
            async move {
                let result = inner.run(&progress_tx, &run_cancel).await;
                inner.finish(id);
                result
            }
            .instrument(info_span!("sync", run = id)),
        );

        let outcome = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(SyncError::Internal(format!("sync task failed: {e}"))),
            }
        }
        .boxed()
        .shared();

        *active = Some(ActiveSync {
            id,
            outcome: outcome.clone(),
            progress: progress_rx.clone(),
            cancel,
        });

        SyncRun {
            outcome,
            progress: progress_rx,
            joined: false,
        }
    }

    /// Run (or join) a sync and wait for its result.
    pub async fn sync(&self) -> Result<SyncProgress, SyncError> {
        self.start().wait().await
    }

    /// Abort the active sync: in-flight requests are dropped and scheduled
    /// retry waits end. Affected items stay pending. Returns whether a sync
    /// was running.
    pub fn cancel(&self) -> bool {
        let running = match self.inner.active().as_ref() {
            Some(run) => {
                run.cancel.cancel();
                true
            }
            None => false,
        };
        let timers = self.inner.timers.cancel_all();
        info!(running, timers, "sync cancelled");
        running
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("config", &self.inner.config)
            .field("syncing", &self.is_syncing())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn active(&self) -> MutexGuard<'_, Option<ActiveSync>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, id: u64) {
        let mut active = self.active();
        if active.as_ref().is_some_and(|run| run.id == id) {
            *active = None;
        }
    }

    async fn run(
        &self,
        progress_tx: &watch::Sender<SyncProgress>,
        cancel: &CancellationToken,
    ) -> Result<SyncProgress, SyncError> {
        self.telemetry.sync_started();
        let mut progress = SyncProgress::default();

        let result = self.drain(&mut progress, progress_tx, cancel).await;
        match &result {
            Ok(done) => {
                info!(
                    total = done.total,
                    synced = done.synced,
                    failed = done.failed,
                    retrying = done.retrying,
                    "sync complete"
                );
                self.telemetry.sync_finished(*done);
            }
            Err(e) => {
                warn!(error = %e, processed = progress.processed(), "sync aborted");
                self.telemetry.sync_aborted(progress);
            }
        }
        result
    }

    async fn drain(
        &self,
        progress: &mut SyncProgress,
        progress_tx: &watch::Sender<SyncProgress>,
        cancel: &CancellationToken,
    ) -> Result<SyncProgress, SyncError> {
        let auth = self.resolve_auth().await?;
        let client_id = match self.client_id {
            Some(id) => id,
            None => self.queue.client_id().await?,
        };

        for leftover in self.queue.purge_synced(auth.tenant_id).await? {
            debug!(id = leftover.id, "purged synced leftover");
            self.discard_attachment(&leftover).await;
        }

        let pending = self.queue.list_pending(auth.tenant_id).await?;
        progress.total = pending.len();
        progress_tx.send_replace(*progress);
        info!(tenant_id = %auth.tenant_id, pending = pending.len(), "starting sync");

        let batch_size = self.config.batch_size.max(1);
        for batch in pending.chunks(batch_size) {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            // Child token: a 401 stops this batch's siblings without cancelling the run handle.
            let batch_cancel = cancel.child_token();
            let outcomes = join_all(
                batch
                    .iter()
                    .map(|item| self.process_item(&auth, client_id, item, &batch_cancel)),
            )
            .await;

            let mut unauthorized = false;
            for outcome in outcomes {
                match outcome {
                    ItemOutcome::Synced => progress.synced += 1,
                    ItemOutcome::Retrying => progress.retrying += 1,
                    ItemOutcome::Failed => progress.failed += 1,
                    ItemOutcome::Unauthorized => unauthorized = true,
                    ItemOutcome::Skipped => {}
                }
            }
            progress_tx.send_replace(*progress);

            if unauthorized {
                return Err(SyncError::Unauthorized);
            }
        }

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(*progress)
    }

    async fn resolve_auth(&self) -> Result<AuthState, SyncError> {
        let state = match self.auth.auth_state().await {
            Ok(state) => state,
            Err(e) => {
                self.telemetry
                    .record_failure(FailureCategory::Auth, None, e.to_string(), false);
                return Err(e.into());
            }
        };
        if !self.auth.is_token_expired(state.expires_at) {
            return Ok(state);
        }

        info!("access token expired; refreshing before sync");
        self.auth.refresh().await.map_err(|e| {
            self.telemetry
                .record_failure(FailureCategory::Auth, None, e.to_string(), false);
            SyncError::from(e)
        })
    }

    #[instrument(
        skip_all,
        fields(id = item.id, key = %item.idempotency_key, retries = item.retries)
    )]
    async fn process_item(
        &self,
        auth: &AuthState,
        client_id: ClientId,
        item: &QueueItem,
        cancel: &CancellationToken,
    ) -> ItemOutcome {
        let delay = self.config.backoff.delay(item.retries);
        if !self.timers.sleep(item.id, delay, cancel).await {
            return ItemOutcome::Skipped;
        }

        let attachment_url = match self.upload_attachment(auth, item, cancel).await {
            Ok(url) => url,
            Err(outcome) => return outcome,
        };

        let submission = Submission {
            tenant_id: item.tenant_id,
            idempotency_key: item.idempotency_key.clone(),
            envelope: MutationEnvelope {
                entity_id: item.entity_id.clone(),
                payload: item.payload.clone(),
                attachment_url,
                updated_at: item.created_at,
                client_id,
            },
        };

        let result = self
            .transport
            .submit(&auth.access_token, &submission, cancel)
            .await;
        if cancel.is_cancelled() {
            debug!("discarding result of cancelled submission");
            return ItemOutcome::Skipped;
        }

        let response = match result {
            Ok(response) => response,
            Err(TransportError::Cancelled) => return ItemOutcome::Skipped,
            Err(e) => {
                return self
                    .retry_or_drop(item, transport_category(&e), e.to_string())
                    .await;
            }
        };

        match classify(&response, self.config.rejection_policy) {
            Disposition::Synced => self.confirm(item).await,
            Disposition::Retry(category) => {
                let message = format!("HTTP {}", response.status);
                self.retry_or_drop(item, category, message).await
            }
            Disposition::Reject(category) => {
                let message = format!(
                    "rejected with HTTP {}: {}",
                    response.status,
                    response.error_code().unwrap_or("unknown")
                );
                self.drop_item(item, category, message).await
            }
            Disposition::Unauthorized => self.unauthorized(item, cancel),
        }
    }

    /// `Ok(None)` when the item has no attachment. `Err` carries the item's
    /// outcome when the upload failed.
    async fn upload_attachment(
        &self,
        auth: &AuthState,
        item: &QueueItem,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ItemOutcome> {
        let Some(attachment_ref) = item.attachment_ref.as_deref() else {
            return Ok(None);
        };
        let Some(coordinator) = &self.attachments else {
            warn!(
                blob = attachment_ref,
                "item has an attachment but no attachment store is configured"
            );
            let message = "no attachment store configured".to_string();
            return Err(self
                .retry_or_drop(item, FailureCategory::Storage, message)
                .await);
        };

        match coordinator
            .upload_attachment(auth, &item.entity_id, attachment_ref, cancel)
            .await
        {
            Ok(url) => Ok(Some(url)),
            Err(_) if cancel.is_cancelled() => Err(ItemOutcome::Skipped),
            Err(e) if e.is_unauthorized() => Err(self.unauthorized(item, cancel)),
            Err(e) => {
                let category = upload_category(&e);
                Err(self
                    .retry_or_drop(item, category, format!("attachment upload failed: {e}"))
                    .await)
            }
        }
    }

    fn unauthorized(&self, item: &QueueItem, cancel: &CancellationToken) -> ItemOutcome {
        warn!(id = item.id, "server rejected credentials; aborting sync");
        cancel.cancel();
        self.telemetry
            .record_failure(FailureCategory::Auth, Some(item.id), "HTTP 401", false);
        ItemOutcome::Unauthorized
    }

    async fn confirm(&self, item: &QueueItem) -> ItemOutcome {
        match self.queue.mark_synced(item.id).await {
            Ok(true) => {}
            Ok(false) => debug!("item already confirmed"),
            Err(e) => {
                self.storage_failure(item, &e);
                return ItemOutcome::Retrying;
            }
        }

        self.discard_attachment(item).await;
        if let Err(e) = self.queue.remove_synced(item.id).await {
            // Left for purge_synced at the start of the next run.
            warn!(error = %e, "failed to remove synced item");
        }

        self.telemetry.item_synced();
        debug!("item synced");
        ItemOutcome::Synced
    }

    async fn retry_or_drop(
        &self,
        item: &QueueItem,
        category: FailureCategory,
        message: String,
    ) -> ItemOutcome {
        if !self.config.should_retry(item.retries) {
            let message = format!("{message} (gave up after {} retries)", item.retries);
            return self.drop_item(item, category, message).await;
        }

        match self.queue.increment_retry(item.id).await {
            Ok(retries) => {
                warn!(retries, %message, "submission failed; will retry");
                self.telemetry
                    .record_failure(category, Some(item.id), message, false);
                self.telemetry.item_retried();
            }
            Err(e) => self.storage_failure(item, &e),
        }
        ItemOutcome::Retrying
    }

    async fn drop_item(
        &self,
        item: &QueueItem,
        category: FailureCategory,
        message: String,
    ) -> ItemOutcome {
        if let Err(e) = self.queue.delete_permanently_failed(item.id).await {
            self.storage_failure(item, &e);
            return ItemOutcome::Retrying;
        }
        self.discard_attachment(item).await;

        warn!(%message, "dropping permanently failed item");
        self.telemetry
            .record_failure(category, Some(item.id), message, true);
        ItemOutcome::Failed
    }

    async fn discard_attachment(&self, item: &QueueItem) {
        if let (Some(attachment_ref), Some(coordinator)) =
            (&item.attachment_ref, &self.attachments)
        {
            coordinator.discard(attachment_ref).await;
        }
    }

    fn storage_failure(&self, item: &QueueItem, error: &dyn std::fmt::Display) {
        warn!(error = %error, "queue update failed; item stays pending");
        self.telemetry
            .record_failure(FailureCategory::Storage, Some(item.id), error.to_string(), false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use fieldsync_core::{EntityId, IdempotencyKey, TenantId};

    use crate::attachments::AttachmentUploader;
    use crate::auth::AuthError;
    use crate::backoff::BackoffPolicy;
    use crate::types::NewMutation;

    type Reply = Result<SubmissionResponse, TransportError>;

    /// Replies per entity id in order; falls back to 201 when the script runs out.
    #[derive(Default)]
    struct ScriptedTransport {
        scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
        calls: Mutex<Vec<(String, Submission)>>,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedTransport {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn script(&self, entity: &str, replies: Vec<Reply>) {
            self.scripts
                .lock()
                .unwrap()
                .insert(entity.to_string(), replies.into());
        }

        fn calls(&self) -> Vec<(String, Submission)> {
            self.calls.lock().unwrap().clone()
        }

        fn calls_for(&self, entity: &str) -> usize {
            self.calls()
                .iter()
                .filter(|(_, s)| s.envelope.entity_id.as_str() == entity)
                .count()
        }
    }

    #[async_trait::async_trait]
    impl SubmissionTransport for ScriptedTransport {
        async fn submit(
            &self,
            access_token: &str,
            submission: &Submission,
            cancel: &CancellationToken,
        ) -> Result<SubmissionResponse, TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push((access_token.to_string(), submission.clone()));

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let waited = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(self.delay) => true,
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if !waited {
                return Err(TransportError::Cancelled);
            }

            let scripted = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(submission.envelope.entity_id.as_str())
                .and_then(|replies| replies.pop_front());
            scripted.unwrap_or_else(|| Ok(status(201)))
        }
    }

    struct TestAuth {
        state: Mutex<AuthState>,
        refreshed: Mutex<Option<Result<AuthState, AuthError>>>,
        refreshes: AtomicUsize,
    }

    impl TestAuth {
        fn valid(tenant_id: TenantId) -> Self {
            Self {
                state: Mutex::new(session(tenant_id, "token-1", chrono::Duration::minutes(10))),
                refreshed: Mutex::new(None),
                refreshes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl AuthProvider for TestAuth {
        async fn auth_state(&self) -> Result<AuthState, AuthError> {
            Ok(self.state.lock().unwrap().clone())
        }

        async fn refresh(&self) -> Result<AuthState, AuthError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            self.refreshed
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(Err(AuthError::NotAuthenticated))
        }
    }

    struct FlakyUploader {
        fail: bool,
        uploads: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl AttachmentUploader for FlakyUploader {
        async fn upload(
            &self,
            _auth: &AuthState,
            path: &str,
            _bytes: Vec<u8>,
            _cancel: &CancellationToken,
        ) -> Result<String, UploadError> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(UploadError::Rejected {
                    status: 503,
                    message: "storage unavailable".into(),
                });
            }
            Ok(format!("/attachments/{path}"))
        }
    }

    fn session(tenant_id: TenantId, token: &str, expires_in: chrono::Duration) -> AuthState {
        AuthState {
            tenant_id,
            access_token: token.into(),
            expires_at: Utc::now() + expires_in,
        }
    }

    fn status(code: u16) -> SubmissionResponse {
        SubmissionResponse::new(code, json!({ "result": "ok" }))
    }

    fn error(code: u16, error_code: &str) -> SubmissionResponse {
        SubmissionResponse::new(code, json!({ "error": error_code, "message": "x" }))
    }

    fn fast_config() -> SyncConfig {
        SyncConfig::default().with_backoff(BackoffPolicy::immediate())
    }

    struct Harness {
        orchestrator: SyncOrchestrator,
        transport: Arc<ScriptedTransport>,
        auth: Arc<TestAuth>,
        tenant: TenantId,
    }

    async fn harness(transport: ScriptedTransport, config: SyncConfig) -> Harness {
        let tenant = TenantId::new();
        let transport = Arc::new(transport);
        let auth = Arc::new(TestAuth::valid(tenant));
        let queue = MutationQueue::open_in_memory().await.unwrap();
        let orchestrator = SyncOrchestrator::builder(queue, auth.clone(), transport.clone())
            .config(config)
            .build();
        Harness {
            orchestrator,
            transport,
            auth,
            tenant,
        }
    }

    async fn enqueue(h: &Harness, entity: &str) -> QueueItem {
        h.orchestrator
            .queue()
            .enqueue(NewMutation::new(
                h.tenant,
                EntityId::new(entity).unwrap(),
                json!({ "value": entity }),
            ))
            .await
            .unwrap()
    }

    #[test]
    fn classification_table() {
        let fail_fast = RejectionPolicy::FailFast;
        assert_eq!(classify(&status(200), fail_fast), Disposition::Synced);
        assert_eq!(classify(&status(201), fail_fast), Disposition::Synced);
        assert_eq!(classify(&status(401), fail_fast), Disposition::Unauthorized);
        assert_eq!(
            classify(&error(409, codes::IDEMPOTENCY_KEY_REUSED), fail_fast),
            Disposition::Reject(FailureCategory::Conflict)
        );
        assert_eq!(
            classify(
                &error(409, codes::IDEMPOTENCY_KEY_REUSED),
                RejectionPolicy::ExhaustRetries
            ),
            Disposition::Reject(FailureCategory::Conflict)
        );
        assert_eq!(
            classify(&error(409, codes::IDEMPOTENCY_IN_PROGRESS), fail_fast),
            Disposition::Retry(FailureCategory::Conflict)
        );
        assert_eq!(classify(&status(409), fail_fast), Disposition::Synced);
        assert_eq!(classify(&status(408), fail_fast), Disposition::Retry(FailureCategory::Timeout));
        assert_eq!(classify(&status(429), fail_fast), Disposition::Retry(FailureCategory::Server));
        assert_eq!(classify(&status(503), fail_fast), Disposition::Retry(FailureCategory::Server));
        assert_eq!(
            classify(&status(422), fail_fast),
            Disposition::Reject(FailureCategory::Unknown)
        );
        assert_eq!(
            classify(&status(422), RejectionPolicy::ExhaustRetries),
            Disposition::Retry(FailureCategory::Unknown)
        );
    }

    #[tokio::test]
    async fn clean_sync_drains_queue() {
        let h = harness(ScriptedTransport::default(), fast_config()).await;
        let key = IdempotencyKey::new("k1").unwrap();
        let item = h
            .orchestrator
            .queue()
            .enqueue(
                NewMutation::new(h.tenant, EntityId::new("r1").unwrap(), json!({ "value": 1 }))
                    .with_idempotency_key(key.clone()),
            )
            .await
            .unwrap();

        let progress = h.orchestrator.sync().await.unwrap();

        assert_eq!(progress, SyncProgress { total: 1, synced: 1, failed: 0, retrying: 0 });
        assert_eq!(h.orchestrator.queue().pending_count(h.tenant).await.unwrap(), 0);
        assert!(h.orchestrator.queue().get(item.id).await.unwrap().is_none());

        let calls = h.transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "token-1");
        assert_eq!(calls[0].1.idempotency_key, key);
        assert_eq!(calls[0].1.envelope.updated_at, item.created_at);
        assert!(!h.orchestrator.is_syncing());
    }

    #[tokio::test]
    async fn transient_failure_is_retried_with_same_key_and_body() {
        let h = harness(ScriptedTransport::default(), fast_config()).await;
        h.transport.script("r1", vec![Ok(status(500)), Ok(status(200))]);
        let item = enqueue(&h, "r1").await;

        let first = h.orchestrator.sync().await.unwrap();
        assert_eq!(first.retrying, 1);
        assert_eq!(h.orchestrator.queue().get(item.id).await.unwrap().unwrap().retries, 1);

        let second = h.orchestrator.sync().await.unwrap();
        assert_eq!(second.synced, 1);
        assert_eq!(h.orchestrator.queue().pending_count(h.tenant).await.unwrap(), 0);

        let calls = h.transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, calls[1].1);
    }

    #[tokio::test]
    async fn network_errors_take_the_retry_path() {
        let h = harness(ScriptedTransport::default(), fast_config()).await;
        h.transport.script("r1", vec![Err(TransportError::Timeout)]);
        enqueue(&h, "r1").await;

        let progress = h.orchestrator.sync().await.unwrap();
        assert_eq!(progress.retrying, 1);

        let failures = h.orchestrator.telemetry().snapshot().failures;
        assert_eq!(failures[0].category, FailureCategory::Timeout);
    }

    #[tokio::test]
    async fn unauthorized_aborts_and_leaves_items_pending() {
        let h = harness(ScriptedTransport::default(), fast_config()).await;
        for entity in ["r1", "r2", "r3"] {
            h.transport.script(entity, vec![Ok(error(401, codes::UNAUTHORIZED))]);
            enqueue(&h, entity).await;
        }

        let err = h.orchestrator.sync().await.unwrap_err();
        assert_eq!(err, SyncError::Unauthorized);

        let pending = h.orchestrator.queue().list_pending(h.tenant).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert!(pending.iter().all(|i| i.retries == 0));

        let snap = h.orchestrator.telemetry().snapshot();
        assert_eq!(snap.syncs_aborted, 1);
        assert_eq!(snap.failures[0].category, FailureCategory::Auth);
    }

    #[tokio::test]
    async fn unauthorized_stops_later_batches() {
        let h = harness(ScriptedTransport::default(), fast_config().with_batch_size(2)).await;
        h.transport.script("r1", vec![Ok(error(401, codes::UNAUTHORIZED))]);
        let first = enqueue(&h, "r1").await;
        enqueue(&h, "r2").await;
        enqueue(&h, "r3").await;

        assert_eq!(h.orchestrator.sync().await.unwrap_err(), SyncError::Unauthorized);
        assert_eq!(h.transport.calls_for("r3"), 0);
        let first = h.orchestrator.queue().get(first.id).await.unwrap().unwrap();
        assert_eq!(first.retries, 0);
        assert!(h.orchestrator.queue().pending_count(h.tenant).await.unwrap() >= 2);
    }

    #[tokio::test]
    async fn overlapping_syncs_share_one_run() {
        let h = harness(
            ScriptedTransport::with_delay(Duration::from_millis(50)),
            fast_config(),
        )
        .await;
        enqueue(&h, "r1").await;

        let first = h.orchestrator.start();
        let second = h.orchestrator.start();
        assert!(!first.joined_existing());
        assert!(second.joined_existing());
        assert!(h.orchestrator.is_syncing());

        let (a, b, c) = tokio::join!(first.wait(), second.wait(), h.orchestrator.sync());
        assert_eq!(a.clone().unwrap(), b.unwrap());
        assert_eq!(a.unwrap(), c.unwrap());
        assert_eq!(h.transport.calls().len(), 1);
        assert_eq!(h.orchestrator.telemetry().snapshot().syncs_started, 1);
    }

    #[tokio::test]
    async fn cancel_leaves_in_flight_items_pending() {
        let h = harness(
            ScriptedTransport::with_delay(Duration::from_secs(30)),
            fast_config(),
        )
        .await;
        let item = enqueue(&h, "r1").await;

        let run = h.orchestrator.start();
        while h.transport.calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(h.orchestrator.cancel());

        assert_eq!(run.wait().await.unwrap_err(), SyncError::Cancelled);
        let stored = h.orchestrator.queue().get(item.id).await.unwrap().unwrap();
        assert!(!stored.synced);
        assert_eq!(stored.retries, 0);
        assert!(!h.orchestrator.is_syncing());
    }

    #[tokio::test]
    async fn cancel_interrupts_backoff_wait() {
        let config = SyncConfig::default().with_backoff(
            BackoffPolicy::default()
                .with_base_delay(Duration::from_secs(60))
                .with_jitter_factor(0.0),
        );
        let h = harness(ScriptedTransport::default(), config).await;
        enqueue(&h, "r1").await;

        let run = h.orchestrator.start();
        while h.orchestrator.inner.timers.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        h.orchestrator.cancel();

        assert_eq!(run.wait().await.unwrap_err(), SyncError::Cancelled);
        assert!(h.transport.calls().is_empty());
        assert!(h.orchestrator.inner.timers.is_empty());
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let h = harness(ScriptedTransport::default(), fast_config().with_max_retries(2)).await;
        h.transport.script(
            "r1",
            vec![Ok(status(500)), Ok(status(502)), Ok(status(503))],
        );
        enqueue(&h, "r1").await;

        assert_eq!(h.orchestrator.sync().await.unwrap().retrying, 1);
        assert_eq!(h.orchestrator.sync().await.unwrap().retrying, 1);
        let last = h.orchestrator.sync().await.unwrap();
        assert_eq!(last.failed, 1);

        assert_eq!(h.orchestrator.queue().pending_count(h.tenant).await.unwrap(), 0);
        assert_eq!(h.transport.calls().len(), 3);

        let snap = h.orchestrator.telemetry().snapshot();
        assert_eq!(snap.items_failed, 1);
        assert!(snap.failures.last().unwrap().permanent);
        assert_eq!(snap.failures.last().unwrap().category, FailureCategory::Server);
    }

    #[tokio::test]
    async fn business_rejection_fails_fast_by_default() {
        let h = harness(ScriptedTransport::default(), fast_config()).await;
        h.transport.script("r1", vec![Ok(error(422, codes::VALIDATION_ERROR))]);
        enqueue(&h, "r1").await;

        let progress = h.orchestrator.sync().await.unwrap();
        assert_eq!(progress.failed, 1);
        assert_eq!(h.orchestrator.queue().pending_count(h.tenant).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn business_rejection_can_exhaust_retries() {
        let config = fast_config().with_rejection_policy(RejectionPolicy::ExhaustRetries);
        let h = harness(ScriptedTransport::default(), config).await;
        h.transport.script("r1", vec![Ok(error(422, codes::VALIDATION_ERROR))]);
        let item = enqueue(&h, "r1").await;

        let progress = h.orchestrator.sync().await.unwrap();
        assert_eq!(progress.retrying, 1);
        assert_eq!(h.orchestrator.queue().get(item.id).await.unwrap().unwrap().retries, 1);
    }

    #[tokio::test]
    async fn conflicts_are_settled_by_error_code() {
        let h = harness(ScriptedTransport::default(), fast_config()).await;
        h.transport.script("applied", vec![Ok(status(409))]);
        h.transport.script("reused", vec![Ok(error(409, codes::IDEMPOTENCY_KEY_REUSED))]);
        h.transport.script("racing", vec![Ok(error(409, codes::IDEMPOTENCY_IN_PROGRESS))]);
        enqueue(&h, "applied").await;
        enqueue(&h, "reused").await;
        let racing = enqueue(&h, "racing").await;

        let progress = h.orchestrator.sync().await.unwrap();
        assert_eq!(
            progress,
            SyncProgress { total: 3, synced: 1, failed: 1, retrying: 1 }
        );

        let pending = h.orchestrator.queue().list_pending(h.tenant).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, racing.id);

        let snap = h.orchestrator.telemetry().snapshot();
        assert_eq!(snap.items_synced, 1);
        assert_eq!(snap.items_failed, 1);
        let conflicts: Vec<_> = snap
            .failures
            .iter()
            .filter(|f| f.category == FailureCategory::Conflict)
            .map(|f| f.permanent)
            .collect();
        assert_eq!(conflicts.len(), 2);
        assert_eq!(conflicts.iter().filter(|permanent| **permanent).count(), 1);
    }

    #[tokio::test]
    async fn reused_key_is_reported_as_failure_not_success() {
        let h = harness(ScriptedTransport::default(), fast_config()).await;
        h.transport
            .script("r1", vec![Ok(error(409, codes::IDEMPOTENCY_KEY_REUSED))]);
        let item = enqueue(&h, "r1").await;

        let progress = h.orchestrator.sync().await.unwrap();
        assert_eq!(
            progress,
            SyncProgress { total: 1, synced: 0, failed: 1, retrying: 0 }
        );
        assert!(h.orchestrator.queue().get(item.id).await.unwrap().is_none());
        assert_eq!(h.transport.calls().len(), 1);

        let snap = h.orchestrator.telemetry().snapshot();
        assert_eq!(snap.items_synced, 0);
        let failure = snap.failures.last().unwrap();
        assert_eq!(failure.category, FailureCategory::Conflict);
        assert_eq!(failure.queue_id, Some(item.id));
        assert!(failure.permanent);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_before_sync() {
        let h = harness(ScriptedTransport::default(), fast_config()).await;
        *h.auth.state.lock().unwrap() = session(h.tenant, "stale", chrono::Duration::minutes(-1));
        *h.auth.refreshed.lock().unwrap() =
            Some(Ok(session(h.tenant, "fresh", chrono::Duration::minutes(10))));
        enqueue(&h, "r1").await;

        h.orchestrator.sync().await.unwrap();
        assert_eq!(h.auth.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.calls()[0].0, "fresh");
    }

    #[tokio::test]
    async fn failed_refresh_aborts_before_any_submission() {
        let h = harness(ScriptedTransport::default(), fast_config()).await;
        *h.auth.state.lock().unwrap() = session(h.tenant, "stale", chrono::Duration::minutes(-1));
        *h.auth.refreshed.lock().unwrap() = Some(Err(AuthError::RefreshFailed("offline".into())));
        enqueue(&h, "r1").await;

        let err = h.orchestrator.sync().await.unwrap_err();
        assert!(matches!(err, SyncError::Auth(_)));
        assert!(h.transport.calls().is_empty());
        assert_eq!(h.orchestrator.queue().pending_count(h.tenant).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn batches_bound_concurrency_and_report_progress() {
        let h = harness(
            ScriptedTransport::with_delay(Duration::from_millis(10)),
            fast_config().with_batch_size(2),
        )
        .await;
        for i in 0..5 {
            enqueue(&h, &format!("r{i}")).await;
        }

        let run = h.orchestrator.start();
        let progress = run.progress();
        let result = run.wait().await.unwrap();

        assert_eq!(result, SyncProgress { total: 5, synced: 5, failed: 0, retrying: 0 });
        assert_eq!(*progress.borrow(), result);
        assert_eq!(h.transport.max_in_flight.load(Ordering::SeqCst), 2);
    }

    async fn attachment_harness(
        fail: bool,
    ) -> (Harness, LocalBlobStore, Arc<FlakyUploader>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let blobs = LocalBlobStore::open(dir.path()).await.unwrap();
        let uploader = Arc::new(FlakyUploader {
            fail,
            uploads: AtomicUsize::new(0),
        });

        let tenant = TenantId::new();
        let transport = Arc::new(ScriptedTransport::default());
        let auth = Arc::new(TestAuth::valid(tenant));
        let orchestrator = SyncOrchestrator::builder(
            MutationQueue::open_in_memory().await.unwrap(),
            auth.clone(),
            transport.clone(),
        )
        .config(fast_config())
        .attachments(AttachmentCoordinator::new(blobs.clone(), uploader.clone()))
        .build();

        let h = Harness {
            orchestrator,
            transport,
            auth,
            tenant,
        };
        (h, blobs, uploader, dir)
    }

    #[tokio::test]
    async fn attachment_is_uploaded_then_deleted_after_confirmation() {
        let (h, blobs, uploader, _dir) = attachment_harness(false).await;
        blobs.put("photo.jpg", b"jpeg").await.unwrap();
        h.orchestrator
            .queue()
            .enqueue(
                NewMutation::new(h.tenant, EntityId::new("r1").unwrap(), json!({}))
                    .with_attachment("photo.jpg"),
            )
            .await
            .unwrap();

        let progress = h.orchestrator.sync().await.unwrap();
        assert_eq!(progress.synced, 1);
        assert_eq!(uploader.uploads.load(Ordering::SeqCst), 1);
        assert!(!blobs.exists("photo.jpg").await.unwrap());

        let sent = &h.transport.calls()[0].1;
        assert_eq!(
            sent.envelope.attachment_url.as_deref(),
            Some(format!("/attachments/tenants/{}/entities/r1/photo.jpg", h.tenant).as_str())
        );
    }

    #[tokio::test]
    async fn failed_upload_keeps_blob_and_skips_submission() {
        let (h, blobs, uploader, _dir) = attachment_harness(true).await;
        blobs.put("photo.jpg", b"jpeg").await.unwrap();
        let item = h
            .orchestrator
            .queue()
            .enqueue(
                NewMutation::new(h.tenant, EntityId::new("r1").unwrap(), json!({}))
                    .with_attachment("photo.jpg"),
            )
            .await
            .unwrap();

        let progress = h.orchestrator.sync().await.unwrap();
        assert_eq!(progress.retrying, 1);
        assert_eq!(uploader.uploads.load(Ordering::SeqCst), 1);
        assert!(h.transport.calls().is_empty());
        assert!(blobs.exists("photo.jpg").await.unwrap());
        assert_eq!(h.orchestrator.queue().get(item.id).await.unwrap().unwrap().retries, 1);
    }

    #[tokio::test]
    async fn leftover_synced_rows_are_purged_with_their_blobs() {
        let (h, blobs, _uploader, _dir) = attachment_harness(false).await;
        blobs.put("old.jpg", b"old").await.unwrap();
        let item = h
            .orchestrator
            .queue()
            .enqueue(
                NewMutation::new(h.tenant, EntityId::new("r1").unwrap(), json!({}))
                    .with_attachment("old.jpg"),
            )
            .await
            .unwrap();
        h.orchestrator.queue().mark_synced(item.id).await.unwrap();

        let progress = h.orchestrator.sync().await.unwrap();
        assert_eq!(progress.total, 0);
        assert!(h.orchestrator.queue().get(item.id).await.unwrap().is_none());
        assert!(!blobs.exists("old.jpg").await.unwrap());
        assert!(h.transport.calls().is_empty());
    }
}
