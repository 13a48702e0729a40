use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};

use crate::app::services::{AppServices, blocking};
use crate::app::{dto, errors};

/// GET /quota/:owner_key
pub async fn get_quota(
    Extension(services): Extension<Arc<AppServices>>,
    Path(owner_key): Path<String>,
) -> axum::response::Response {
    let key = match dto::parse_owner_key(&owner_key) {
        Ok(k) => k,
        Err(resp) => return resp,
    };
    let lookup = key.clone();
    match blocking(move || services.submission.quota(&lookup)).await {
        Ok(Ok(Some(snapshot))) => Json(dto::QuotaResponse::new(key, snapshot)).into_response(),
        Ok(Ok(None)) => errors::json_error(
            StatusCode::NOT_FOUND,
            "unknown_account",
            format!("no quota account for {key}"),
        ),
        Ok(Err(e)) => errors::quota_store_error_to_response(e),
        Err(resp) => resp,
    }
}
