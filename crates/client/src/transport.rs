//! Submission transport.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use fieldsync_core::wire::{ErrorBody, IDEMPOTENCY_KEY_HEADER, READINGS_PATH, TENANT_ID_HEADER};
use fieldsync_core::{IdempotencyKey, MutationEnvelope, TenantId};

/// One submission attempt of a queued mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub tenant_id: TenantId,
    pub idempotency_key: IdempotencyKey,
    pub envelope: MutationEnvelope,
}

/// Whatever the server answered, success or not.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionResponse {
    pub status: u16,
    pub body: Value,
    error: Option<ErrorBody>,
}

impl SubmissionResponse {
    pub fn new(status: u16, body: Value) -> Self {
        let error = ErrorBody::deserialize(&body).ok();
        Self {
            status,
            body,
            error,
        }
    }

    /// `error` field of an error body, if present.
    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.error.as_str())
    }

    /// Parsed error body, if the server sent one.
    pub fn error_body(&self) -> Option<&ErrorBody> {
        self.error.as_ref()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failures before an HTTP status was received.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request cancelled")]
    Cancelled,

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_decode() {
            TransportError::InvalidResponse(e.to_string())
        } else {
            TransportError::Network(e.to_string())
        }
    }
}

#[async_trait::async_trait]
pub trait SubmissionTransport: Send + Sync {
    /// Send one submission. Must return `Cancelled` promptly once `cancel` fires.
    async fn submit(
        &self,
        access_token: &str,
        submission: &Submission,
        cancel: &CancellationToken,
    ) -> Result<SubmissionResponse, TransportError>;
}

/// `reqwest`-based transport posting to the readings endpoint.
#[derive(Debug, Clone)]
pub struct HttpSubmissionTransport {
    client: reqwest::Client,
    api_url: String,
}

impl HttpSubmissionTransport {
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
impl SubmissionTransport for HttpSubmissionTransport {
    async fn submit(
        &self,
        access_token: &str,
        submission: &Submission,
        cancel: &CancellationToken,
    ) -> Result<SubmissionResponse, TransportError> {
        let url = format!("{}{}", self.api_url, READINGS_PATH);
        let request = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .header(TENANT_ID_HEADER, submission.tenant_id.to_string())
            .header(IDEMPOTENCY_KEY_HEADER, submission.idempotency_key.as_str())
            .json(&submission.envelope);

        let exchange = async {
            let response = request.send().await?;
            let status = response.status().as_u16();
            let bytes = response.bytes().await?;
            // Proxies may answer with non-JSON bodies; keep the status either way.
            let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            Ok::<_, TransportError>(SubmissionResponse::new(status, body))
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(key = %submission.idempotency_key, "submission cancelled");
                Err(TransportError::Cancelled)
            }
            result = exchange => result,
        }
    }
}
