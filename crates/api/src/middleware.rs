use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use tracing::debug;

use fieldsync_core::{TenantId, wire};

use crate::app::errors::json_error;
use crate::auth::TokenValidator;
use crate::context::{PrincipalContext, TenantContext};

#[derive(Clone)]
pub struct AuthState {
    pub validator: Arc<dyn TokenValidator>,
}

/// Authenticate the bearer token and bind the request to its tenant.
///
/// - missing or invalid token: 401
/// - missing or malformed `X-Tenant-Id`: 400
/// - `X-Tenant-Id` naming another tenant than the token: 403
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    let token = extract_bearer(req.headers()).ok_or_else(|| {
        json_error(
            StatusCode::UNAUTHORIZED,
            wire::codes::UNAUTHORIZED,
            "missing bearer token",
        )
    })?;

    let claims = state.validator.validate(token, Utc::now()).map_err(|e| {
        debug!(error = %e, "rejected bearer token");
        json_error(StatusCode::UNAUTHORIZED, wire::codes::UNAUTHORIZED, e.to_string())
    })?;

    let tenant_id = extract_tenant(req.headers())?;
    if tenant_id != claims.tenant_id {
        return Err(json_error(
            StatusCode::FORBIDDEN,
            wire::codes::FORBIDDEN,
            "token is not valid for the requested tenant",
        ));
    }

    req.extensions_mut().insert(TenantContext::new(tenant_id));
    req.extensions_mut()
        .insert(PrincipalContext::new(claims.sub));

    Ok(next.run(req).await)
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(axum::http::header::AUTHORIZATION)?;
    let header = header.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token)
}

fn extract_tenant(headers: &HeaderMap) -> Result<TenantId, Response> {
    let invalid = |message: &str| {
        json_error(StatusCode::BAD_REQUEST, wire::codes::INVALID_TENANT, message.to_string())
    };

    let raw = headers
        .get(wire::TENANT_ID_HEADER)
        .ok_or_else(|| invalid("missing X-Tenant-Id header"))?;
    let raw = raw
        .to_str()
        .map_err(|_| invalid("X-Tenant-Id must be ASCII"))?;

    TenantId::from_str(raw).map_err(|e| invalid(&e.to_string()))
}
