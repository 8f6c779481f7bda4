//! Attachment coordination: upload a queued item's local blob to its
//! deterministic remote path and clean it up once the item is confirmed.
//!
//! Uploads carry no retry state of their own. Each sync attempt of the owning
//! item tries the upload once; a failure is a failure of that attempt.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use fieldsync_core::wire::{ATTACHMENTS_PATH, TENANT_ID_HEADER};
use fieldsync_core::{AttachmentUploaded, EntityId, ErrorBody, TenantId};

use crate::auth::AuthState;
use crate::blobs::{BlobStoreError, LocalBlobStore};
use crate::transport::TransportError;

/// Remote object path for an attachment. Re-uploads overwrite the same object.
pub fn attachment_path(tenant_id: TenantId, entity_id: &EntityId, attachment_ref: &str) -> String {
    format!("tenants/{tenant_id}/entities/{entity_id}/{attachment_ref}")
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("upload rejected with HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Blob(#[from] BlobStoreError),
}

impl UploadError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, UploadError::Rejected { status: 401, .. })
    }
}

#[async_trait::async_trait]
pub trait AttachmentUploader: Send + Sync {
    /// Store `bytes` at `path`; returns the URL the server reports for it.
    async fn upload(
        &self,
        auth: &AuthState,
        path: &str,
        bytes: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<String, UploadError>;
}

/// Uploads with `PUT {api}/attachments/{path}`.
#[derive(Debug, Clone)]
pub struct HttpAttachmentUploader {
    client: reqwest::Client,
    api_url: String,
}

impl HttpAttachmentUploader {
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, api_url))
    }

    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait::async_trait]
impl AttachmentUploader for HttpAttachmentUploader {
    async fn upload(
        &self,
        auth: &AuthState,
        path: &str,
        bytes: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<String, UploadError> {
        let url = format!("{}{}/{}", self.api_url, ATTACHMENTS_PATH, path);
        let request = self
            .client
            .put(&url)
            .bearer_auth(&auth.access_token)
            .header(TENANT_ID_HEADER, auth.tenant_id.to_string())
            .body(bytes);

        let exchange = async {
            let response = request.send().await.map_err(TransportError::from)?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                let message = match serde_json::from_str::<ErrorBody>(&text) {
                    Ok(body) => format!("{}: {}", body.error, body.message),
                    Err(_) => text,
                };
                return Err(UploadError::Rejected {
                    status: status.as_u16(),
                    message,
                });
            }
            let uploaded: AttachmentUploaded =
                response.json().await.map_err(TransportError::from)?;
            Ok(uploaded.url)
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled.into()),
            result = exchange => result,
        }
    }
}

/// Pairs the local blob store with a remote uploader.
#[derive(Clone)]
pub struct AttachmentCoordinator {
    blobs: LocalBlobStore,
    uploader: Arc<dyn AttachmentUploader>,
}

impl AttachmentCoordinator {
    pub fn new(blobs: LocalBlobStore, uploader: Arc<dyn AttachmentUploader>) -> Self {
        Self { blobs, uploader }
    }

    /// Upload the blob named `attachment_ref` for `entity_id`. The local blob
    /// is left in place; it is deleted only after the mutation is confirmed.
    pub async fn upload_attachment(
        &self,
        auth: &AuthState,
        entity_id: &EntityId,
        attachment_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<String, UploadError> {
        let bytes = self.blobs.read(attachment_ref).await?;
        let path = attachment_path(auth.tenant_id, entity_id, attachment_ref);
        let url = self.uploader.upload(auth, &path, bytes, cancel).await?;
        debug!(%path, %url, "attachment uploaded");
        Ok(url)
    }

    /// Delete the local blob. Failures are logged, never surfaced: the
    /// mutation is already settled and the blob is only wasted space.
    pub async fn discard(&self, attachment_ref: &str) {
        if let Err(e) = self.blobs.delete(attachment_ref).await {
            warn!(blob = attachment_ref, error = %e, "failed to delete local attachment");
        }
    }
}

impl std::fmt::Debug for AttachmentCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentCoordinator")
            .field("blobs", &self.blobs)
            .finish_non_exhaustive()
    }
}
