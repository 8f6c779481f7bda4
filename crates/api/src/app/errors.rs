use axum::http::StatusCode;
use axum::response::IntoResponse;

use fieldsync_core::ErrorBody;
use fieldsync_core::wire::codes;
use fieldsync_ledger::IdempotencyError;

use crate::app::services::ApplyError;

pub fn idempotency_error_to_response(
    err: IdempotencyError<ApplyError>,
) -> axum::response::Response {
    match err {
        IdempotencyError::KeyReused { key } => json_error(
            StatusCode::CONFLICT,
            codes::IDEMPOTENCY_KEY_REUSED,
            format!("idempotency key '{key}' was already used with a different request"),
        ),
        IdempotencyError::InProgress { key } => json_error(
            StatusCode::CONFLICT,
            codes::IDEMPOTENCY_IN_PROGRESS,
            format!("a request with idempotency key '{key}' is still being processed"),
        ),
        IdempotencyError::Handler(e) => apply_error_to_response(e),
    }
}

pub fn apply_error_to_response(err: ApplyError) -> axum::response::Response {
    match err {
        ApplyError::Storage(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, codes::INTERNAL_ERROR, msg)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(ErrorBody {
            error: code.to_string(),
            message: message.into(),
        }),
    )
        .into_response()
}
