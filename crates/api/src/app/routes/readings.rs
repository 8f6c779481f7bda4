//! Reading submission endpoint.
//!
//! `POST /readings` applies a [`MutationEnvelope`] through the idempotency
//! ledger, so a retried submission with the same `Idempotency-Key` is answered
//! from the recorded response instead of being applied twice.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Extension, Path},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};

use fieldsync_core::{EntityId, IdempotencyKey, MutationEnvelope, wire};
use fieldsync_ledger::{Outcome, StoredResponse};

use crate::app::errors::{idempotency_error_to_response, json_error};
use crate::app::services::{AppServices, ApplyError, ApplyOutcome};
use crate::context::TenantContext;

pub async fn submit_reading(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let key = match idempotency_key(&headers) {
        Ok(key) => key,
        Err(resp) => return resp,
    };

    let raw: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return json_error(
                StatusCode::BAD_REQUEST,
                wire::codes::VALIDATION_ERROR,
                format!("invalid JSON body: {e}"),
            );
        }
    };
    let envelope: MutationEnvelope = match serde_json::from_value(raw.clone()) {
        Ok(envelope) => envelope,
        Err(e) => {
            return json_error(
                StatusCode::UNPROCESSABLE_ENTITY,
                wire::codes::VALIDATION_ERROR,
                format!("invalid reading: {e}"),
            );
        }
    };

    let tenant_id = tenant.tenant_id();
    let readings = &services.readings;
    let envelope = &envelope;

    let result = services
        .ledger
        .idempotent(tenant_id, key.as_ref(), wire::READINGS_PATH, &raw, move || async move {
            let applied = readings.apply(tenant_id, envelope)?;
            Ok::<_, ApplyError>(applied_response(envelope, applied))
        })
        .await;

    match result {
        Ok(outcome) => outcome_to_response(outcome),
        Err(e) => idempotency_error_to_response(e),
    }
}

pub async fn get_reading(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(entity_id): Path<String>,
) -> Response {
    let Ok(entity_id) = EntityId::new(entity_id) else {
        return json_error(StatusCode::NOT_FOUND, wire::codes::NOT_FOUND, "reading not found");
    };

    match services.readings.get(tenant.tenant_id(), &entity_id) {
        Some(reading) => (StatusCode::OK, Json(reading)).into_response(),
        None => json_error(StatusCode::NOT_FOUND, wire::codes::NOT_FOUND, "reading not found"),
    }
}

fn idempotency_key(headers: &HeaderMap) -> Result<Option<IdempotencyKey>, Response> {
    let Some(raw) = headers.get(wire::IDEMPOTENCY_KEY_HEADER) else {
        return Ok(None);
    };

    let invalid = |message: String| {
        json_error(
            StatusCode::BAD_REQUEST,
            wire::codes::INVALID_IDEMPOTENCY_KEY,
            message,
        )
    };
    let raw = raw
        .to_str()
        .map_err(|_| invalid("Idempotency-Key must be ASCII".to_string()))?;

    IdempotencyKey::new(raw)
        .map(Some)
        .map_err(|e| invalid(e.to_string()))
}

fn applied_response(envelope: &MutationEnvelope, applied: ApplyOutcome) -> StoredResponse {
    let status = match applied {
        ApplyOutcome::Created => StatusCode::CREATED,
        ApplyOutcome::Updated | ApplyOutcome::Stale => StatusCode::OK,
    };
    StoredResponse::new(
        status.as_u16(),
        json!({
            "entityId": envelope.entity_id,
            "result": applied.as_str(),
            "updatedAt": envelope.updated_at,
        }),
    )
}

fn outcome_to_response(outcome: Outcome) -> Response {
    let replayed = outcome.is_replay();
    let stored = outcome.into_response();
    let status = StatusCode::from_u16(stored.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut response = (status, Json(stored.body)).into_response();
    if replayed {
        if let Ok(name) = HeaderName::from_bytes(wire::IDEMPOTENT_REPLAYED_HEADER.as_bytes()) {
            response
                .headers_mut()
                .insert(name, HeaderValue::from_static("true"));
        }
    }
    response
}
