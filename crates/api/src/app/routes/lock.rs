use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::app::errors::ApiJson;
use crate::app::{dto, errors};
use crate::app::services::AppServices;

/// Acquire or release the processing lock. Both report the current state;
/// the lock itself is derived from the jobs in flight.
pub async fn handle_lock(
    Extension(services): Extension<Arc<AppServices>>,
    ApiJson(body): ApiJson<dto::LockRequest>,
) -> axum::response::Response {
    match services.lock.handle(&body.instance_id, body.action).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}
