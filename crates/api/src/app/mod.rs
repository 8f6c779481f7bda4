//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: ledger, reading store and attachment store wiring
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, extract::DefaultBodyLimit, routing::get};
use tower::ServiceBuilder;

use fieldsync_ledger::LedgerConfig;

use crate::auth::Hs256TokenValidator;
use crate::middleware;

pub mod errors;
pub mod routes;
pub mod services;

/// Upper bound on request bodies; attachments are photos.
const MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

/// Build the router over in-memory services.
pub fn build_app(jwt_secret: impl Into<String>) -> Router {
    let services = Arc::new(services::AppServices::in_memory(LedgerConfig::default()));
    build_app_with(jwt_secret, services)
}

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app_with(
    jwt_secret: impl Into<String>,
    services: Arc<services::AppServices>,
) -> Router {
    let validator = Arc::new(Hs256TokenValidator::new(jwt_secret.into().as_bytes()));
    let auth_state = middleware::AuthState { validator };

    // Protected routes: require auth + tenant context.
    let protected = routes::router()
        .layer(Extension(services))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::auth_middleware,
        ));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
        .layer(ServiceBuilder::new().layer(DefaultBodyLimit::max(MAX_BODY_BYTES)))
}
