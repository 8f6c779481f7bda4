//! Attachment object storage.
//!
//! Objects live under `tenants/{tenantId}/...`; a caller may only read or
//! write below its own tenant prefix. Re-uploading a path overwrites it.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Extension, Path},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};

use fieldsync_core::{AttachmentUploaded, wire};

use crate::app::errors::{apply_error_to_response, json_error};
use crate::app::services::AppServices;
use crate::context::TenantContext;

pub async fn upload_attachment(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(path): Path<String>,
    body: Bytes,
) -> Response {
    let path = match authorize_path(&tenant, &path) {
        Ok(path) => path,
        Err(resp) => return resp,
    };

    if let Err(e) = services.attachments.put(path, body.to_vec()) {
        return apply_error_to_response(e);
    }

    tracing::debug!(path, bytes = body.len(), "stored attachment");
    (
        StatusCode::OK,
        Json(AttachmentUploaded {
            url: format!("{}/{}", wire::ATTACHMENTS_PATH, path),
        }),
    )
        .into_response()
}

pub async fn download_attachment(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(path): Path<String>,
) -> Response {
    let path = match authorize_path(&tenant, &path) {
        Ok(path) => path,
        Err(resp) => return resp,
    };

    match services.attachments.get(path) {
        Some(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        None => json_error(StatusCode::NOT_FOUND, wire::codes::NOT_FOUND, "attachment not found"),
    }
}

/// Normalize `path` and require it to sit under the caller's tenant prefix.
fn authorize_path<'a>(tenant: &TenantContext, path: &'a str) -> Result<&'a str, Response> {
    let path = path.trim_start_matches('/');

    if path.is_empty()
        || path
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            wire::codes::VALIDATION_ERROR,
            "invalid attachment path",
        ));
    }

    let prefix = format!("tenants/{}/", tenant.tenant_id());
    if !path.starts_with(&prefix) {
        return Err(json_error(
            StatusCode::FORBIDDEN,
            wire::codes::FORBIDDEN,
            "attachment path is outside the caller's tenant",
        ));
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_core::TenantId;

    #[test]
    fn path_must_be_under_tenant_prefix() {
        let tenant = TenantContext::new(TenantId::new());
        let own = format!("tenants/{}/entities/r1/photo.jpg", tenant.tenant_id());
        let other = format!("tenants/{}/entities/r1/photo.jpg", TenantId::new());

        assert_eq!(authorize_path(&tenant, &own).unwrap(), own);
        assert_eq!(
            authorize_path(&tenant, &format!("/{own}")).unwrap(),
            own
        );
        assert_eq!(
            authorize_path(&tenant, &other).unwrap_err().status(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn traversal_segments_are_rejected() {
        let tenant = TenantContext::new(TenantId::new());
        let sneaky = format!("tenants/{}/../other/x", tenant.tenant_id());

        assert_eq!(
            authorize_path(&tenant, &sneaky).unwrap_err().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            authorize_path(&tenant, "").unwrap_err().status(),
            StatusCode::BAD_REQUEST
        );
    }
}
