use axum::{
    routing::{get, post},
    Router,
};

pub mod jobs;
pub mod lock;
pub mod system;

/// Router for all endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/processing-lock", post(lock::handle_lock))
        .nest("/jobs", jobs::router())
}
