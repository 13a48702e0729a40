use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tracing::info;

use dirpack_archive::measure_folder;
use dirpack_infra::submission::{JobRef, SubmitRequest};

use crate::app::services::{AppServices, blocking};
use crate::app::{dto, errors};
use crate::context::OwnerContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_download).get(list_downloads))
        .route("/:job_id", get(get_download))
        .route("/:job_id/cancel", post(cancel_download))
}

/// POST /downloads
///
/// Accepts the request and returns 202 with the receipt; the bundle is built
/// in the background and announced on `/events`.
pub async fn submit_download(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(owner): Extension<OwnerContext>,
    Json(body): Json<dto::SubmitDownloadRequest>,
) -> axum::response::Response {
    let quota_account_key = match dto::parse_owner_key(&body.quota_account_key) {
        Ok(k) => k,
        Err(resp) => return resp,
    };
    let (relative, absolute) = match services.resolve_source(&body.path) {
        Ok(v) => v,
        Err(msg) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_path", msg),
    };

    let svc = services.clone();
    let result = blocking(move || {
        let estimated_size_bytes = match body.size_bytes {
            Some(bytes) => bytes,
            None => match measure_folder(&absolute) {
                Ok(stats) => stats.total_bytes,
                Err(e) => {
                    return Err(errors::json_error(
                        StatusCode::NOT_FOUND,
                        "source_not_found",
                        format!("folder `{relative}` cannot be read: {e}"),
                    ));
                }
            },
        };
        let request = SubmitRequest {
            owner_id: owner.owner_id(),
            quota_account_key,
            source_relative_path: relative,
            source_absolute_path: absolute.to_string_lossy().into_owned(),
            estimated_size_bytes,
            version_key: body.version_key,
        };
        svc.submission.submit(request).map_err(errors::submit_error_to_response)
    })
    .await;

    match result {
        Ok(Ok(receipt)) => {
            info!(job_id = %receipt.job_id, owner_id = %owner.owner_id(), "download accepted");
            (StatusCode::ACCEPTED, Json(receipt)).into_response()
        }
        Ok(Err(resp)) | Err(resp) => resp,
    }
}

/// GET /downloads?limit=N
pub async fn list_downloads(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(owner): Extension<OwnerContext>,
    Query(query): Query<dto::HistoryQuery>,
) -> axum::response::Response {
    let limit = dto::history_limit(&query);
    match blocking(move || services.submission.history(owner.owner_id(), limit)).await {
        Ok(Ok(jobs)) => Json(jobs).into_response(),
        Ok(Err(e)) => errors::lookup_error_to_response(e),
        Err(resp) => resp,
    }
}

pub async fn get_download(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(owner): Extension<OwnerContext>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match blocking(move || services.submission.job(job_id, owner.owner_id())).await {
        Ok(Ok(view)) => Json(view).into_response(),
        Ok(Err(e)) => errors::lookup_error_to_response(e),
        Err(resp) => resp,
    }
}

/// POST /downloads/:job_id/cancel
///
/// Only an `in_progress` job can be cancelled; anything else is a 409.
pub async fn cancel_download(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(owner): Extension<OwnerContext>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match blocking(move || services.submission.cancel(JobRef::Record(job_id), owner.owner_id())).await {
        Ok(Ok(job)) => Json(job).into_response(),
        Ok(Err(e)) => errors::cancel_error_to_response(e),
        Err(resp) => resp,
    }
}
