use axum::{
    Router,
    routing::{get, post, put},
};

pub mod attachments;
pub mod readings;
pub mod system;

/// Router for all authenticated (tenant-scoped) endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .route("/readings", post(readings::submit_reading))
        .route("/readings/:entity_id", get(readings::get_reading))
        .route(
            "/attachments/*path",
            put(attachments::upload_attachment).get(attachments::download_attachment),
        )
}
