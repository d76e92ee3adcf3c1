pub mod caller;
pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::enhancement::handlers as enhancements;
use crate::sources::handlers as sources;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Inputs
        .route("/api/v1/cvs", post(sources::handle_upload_cv))
        .route(
            "/api/v1/job-descriptions",
            post(sources::handle_create_job_description),
        )
        // Enhancement requests
        .route("/api/v1/enhancements", post(enhancements::handle_create))
        .route("/api/v1/enhancements/:id", get(enhancements::handle_get))
        .route(
            "/api/v1/enhancements/:id/retrigger",
            post(enhancements::handle_retrigger),
        )
        .route(
            "/api/v1/enhancements/:id/events",
            get(enhancements::handle_events),
        )
        // Provider callbacks authenticate with the shared secret, not a caller id.
        .route(
            "/api/v1/enhancements/:id/callback",
            post(enhancements::handle_callback),
        )
        .with_state(state)
}
