use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use storyforge_infra::jobs::JobError;
use storyforge_jobs::{JobKind, JobRecord, Outcome, ProjectedStatus};

use crate::app::services::AppServices;
use crate::app::errors::ApiJson;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_job))
        .route("/stats", get(job_stats))
        .route("/:id", get(get_job_status))
        .route("/:id/claim", post(claim_job))
        .route("/:id/progress", post(report_progress))
        .route("/:id/heartbeat", post(heartbeat))
        .route("/:id/complete", post(complete_job))
        .route("/:id/fail", post(fail_job))
        .route("/:id/cancel", post(cancel_job))
        .route("/:id/retry", post(retry_job))
}

fn job_view(record: &JobRecord) -> axum::response::Response {
    (StatusCode::OK, Json(ProjectedStatus::from_record(record))).into_response()
}

pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    ApiJson(body): ApiJson<dto::CreateJobRequest>,
) -> axum::response::Response {
    let kind: JobKind = match body.kind.parse() {
        Ok(k) => k,
        Err(e) => return errors::job_error_to_response(JobError::from(e)),
    };

    let record = match services.jobs.create(kind, body.parameters).await {
        Ok(r) => r,
        Err(e) => return errors::job_error_to_response(e),
    };

    let polling_url = services.config.polling_url(record.id);
    (
        StatusCode::ACCEPTED,
        Json(dto::CreateJobResponse::from_record(&record, polling_url)),
    )
        .into_response()
}

pub async fn get_job_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match errors::parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.jobs.get_status(id).await {
        Ok(status) => {
            let cache_control = services.config.cache.header_value(status.status);
            (
                StatusCode::OK,
                [(header::CACHE_CONTROL, cache_control)],
                Json(status),
            )
                .into_response()
        }
        Err(e) => errors::job_error_to_response(e),
    }
}

pub async fn job_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.jobs.stats().await {
        Ok(stats) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "pending": stats.pending,
                "processing": stats.processing,
                "completed": stats.completed,
                "failed": stats.failed,
                "cancelled": stats.cancelled,
                "total": stats.total(),
            })),
        )
            .into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}

pub async fn claim_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<dto::WorkerRequest>,
) -> axum::response::Response {
    let id = match errors::parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.jobs.claim(id, &body.worker_id).await {
        Ok(record) => job_view(&record),
        Err(e) => errors::job_error_to_response(e),
    }
}

pub async fn report_progress(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<dto::ProgressRequest>,
) -> axum::response::Response {
    let id = match errors::parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let progress = match u8::try_from(body.progress) {
        Ok(p) => p,
        Err(_) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "progress must be between 0 and 99 while processing",
            )
        }
    };

    match services
        .jobs
        .report_progress(id, &body.worker_id, progress, body.current_step)
        .await
    {
        Ok(record) => job_view(&record),
        Err(e) => errors::job_error_to_response(e),
    }
}

pub async fn heartbeat(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<dto::WorkerRequest>,
) -> axum::response::Response {
    let id = match errors::parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.jobs.heartbeat(id, &body.worker_id).await {
        Ok(record) => job_view(&record),
        Err(e) => errors::job_error_to_response(e),
    }
}

pub async fn complete_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<dto::CompleteRequest>,
) -> axum::response::Response {
    let id = match errors::parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let outcome = Outcome::Completed {
        result_ref: body.result_ref,
    };
    match services.jobs.finalize(id, Some(&body.worker_id), outcome).await {
        Ok(record) => job_view(&record),
        Err(e) => errors::job_error_to_response(e),
    }
}

/// Finalize as failed, then let the retry coordinator decide unless the
/// worker marked the failure permanent.
pub async fn fail_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<dto::FailRequest>,
) -> axum::response::Response {
    let id = match errors::parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let outcome = Outcome::Failed { error: body.error };
    let failed = match services.jobs.finalize(id, Some(&body.worker_id), outcome).await {
        Ok(record) => record,
        Err(e) => return errors::job_error_to_response(e),
    };

    if !body.retryable {
        return (
            StatusCode::OK,
            Json(dto::RetryOutcomeResponse {
                decision: None,
                job: ProjectedStatus::from_record(&failed),
            }),
        )
            .into_response();
    }

    match services.retry.consider_retry(&failed).await {
        Ok(verdict) => (
            StatusCode::OK,
            Json(dto::RetryOutcomeResponse {
                decision: Some(verdict.decision),
                job: ProjectedStatus::from_record(&verdict.record),
            }),
        )
            .into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}

pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match errors::parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.jobs.cancel(id).await {
        Ok(record) => job_view(&record),
        Err(e) => errors::job_error_to_response(e),
    }
}

pub async fn retry_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match errors::parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.retry.consider_retry_by_id(id).await {
        Ok(verdict) => (
            StatusCode::OK,
            Json(dto::RetryOutcomeResponse {
                decision: Some(verdict.decision),
                job: ProjectedStatus::from_record(&verdict.record),
            }),
        )
            .into_response(),
        Err(e) => errors::job_error_to_response(e),
    }
}
