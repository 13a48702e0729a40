//! Operator endpoints: worker pool statistics and quota account provisioning.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    response::IntoResponse,
    routing::{get, put},
};
use serde_json::json;

use crate::app::services::{AppServices, blocking};
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/workers", get(worker_stats))
        .route("/quota/:owner_key", put(open_account))
}

/// GET /admin/workers
pub async fn worker_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let queue = services.queue.clone();
    let depth = match blocking(move || queue.depth()).await {
        Ok(Ok(depth)) => Some(depth),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "queue depth unavailable");
            None
        }
        Err(resp) => return resp,
    };

    Json(json!({
        "queue": services.queue.queue_name(),
        "queue_depth": depth,
        "pools": services.supervisor.stats(),
    }))
    .into_response()
}

/// PUT /admin/quota/:owner_key
///
/// Creates the account or replaces its allowance; usage is kept.
pub async fn open_account(
    Extension(services): Extension<Arc<AppServices>>,
    Path(owner_key): Path<String>,
    Json(body): Json<dto::OpenAccountRequest>,
) -> axum::response::Response {
    let key = match dto::parse_owner_key(&owner_key) {
        Ok(k) => k,
        Err(resp) => return resp,
    };
    match blocking(move || services.quota.open_account(&key, body.bytes_available)).await {
        Ok(Ok(account)) => Json(dto::QuotaResponse::new(account.owner_key().clone(), account.snapshot())).into_response(),
        Ok(Err(e)) => errors::quota_store_error_to_response(e),
        Err(resp) => resp,
    }
}
