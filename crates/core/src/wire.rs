//! Submission wire contract shared by the sync client and the API.
//!
//! The client sends a [`MutationEnvelope`] to the submission endpoint with the
//! headers named here; the server answers with a JSON body, and failures use
//! the [`ErrorBody`] shape with one of the `codes`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{ClientId, EntityId};

/// Header carrying the client-generated idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Header carrying the tenant the request is scoped to.
pub const TENANT_ID_HEADER: &str = "X-Tenant-Id";

/// Header set on responses served from the idempotency ledger instead of a fresh execution.
pub const IDEMPOTENT_REPLAYED_HEADER: &str = "Idempotent-Replayed";

/// Path of the reading submission endpoint.
pub const READINGS_PATH: &str = "/readings";

/// Path prefix of the attachment upload endpoint.
pub const ATTACHMENTS_PATH: &str = "/attachments";

/// Body of a queued mutation as it travels to the server.
///
/// `updated_at` and `client_id` drive last-write-wins on the server. The
/// client fills `updated_at` with the time the mutation was recorded, not the
/// time it was sent, so every retry carries a byte-identical body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationEnvelope {
    pub entity_id: EntityId,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub client_id: ClientId,
}

/// Response of the attachment upload endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentUploaded {
    pub url: String,
}

/// Uniform error body: `{ "error": <code>, "message": <text> }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// Machine-readable error codes used in [`ErrorBody::error`].
pub mod codes {
    /// Same idempotency key, different request body or path.
    pub const IDEMPOTENCY_KEY_REUSED: &str = "idempotency_key_reused";
    /// Another request with the same key is still executing.
    pub const IDEMPOTENCY_IN_PROGRESS: &str = "idempotency_request_in_progress";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const FORBIDDEN: &str = "forbidden";
    pub const INVALID_TENANT: &str = "invalid_tenant";
    pub const INVALID_IDEMPOTENCY_KEY: &str = "invalid_idempotency_key";
    pub const VALIDATION_ERROR: &str = "validation_error";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const NOT_FOUND: &str = "not_found";
}
