//! `fieldsync-client`: offline-first side of the sync protocol.
//!
//! Mutations are recorded in a durable SQLite queue and drained by the
//! [`SyncOrchestrator`] whenever connectivity allows. Each queued item keeps a
//! stable idempotency key so the server can apply it at most once no matter
//! how often it is retried.

pub mod attachments;
pub mod auth;
pub mod backoff;
pub mod blobs;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod queue;
pub mod telemetry;
pub mod timers;
pub mod transport;
pub mod types;

pub use attachments::{
    AttachmentCoordinator, AttachmentUploader, HttpAttachmentUploader, UploadError, attachment_path,
};
pub use auth::{AuthError, AuthProvider, AuthState, StaticTokenProvider};
pub use backoff::BackoffPolicy;
pub use blobs::{BlobStoreError, LocalBlobStore};
pub use config::{ClientConfig, ConfigError, RejectionPolicy, SyncConfig};
pub use error::SyncError;
pub use orchestrator::{Disposition, SyncOrchestrator, SyncOrchestratorBuilder, SyncRun, classify};
pub use queue::{MutationQueue, QueueError};
pub use telemetry::{FailureCategory, FailureRecord, SessionTelemetry, TelemetrySnapshot};
pub use timers::RetryTimers;
pub use transport::{
    HttpSubmissionTransport, Submission, SubmissionResponse, SubmissionTransport, TransportError,
};
pub use types::{NewMutation, QueueId, QueueItem, SyncProgress};
