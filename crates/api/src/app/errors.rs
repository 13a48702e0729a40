use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use dirpack_infra::ledger::QuotaStoreError;
use dirpack_infra::submission::{CancelError, LookupError, SubmitError};
use dirpack_quota::QuotaError;

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        e @ SubmitError::OwnerBusy { .. } => json_error(StatusCode::CONFLICT, "owner_busy", e.to_string()),
        e @ SubmitError::PipelineBusy { .. } => json_error(StatusCode::CONFLICT, "pipeline_busy", e.to_string()),
        SubmitError::Quota(e) => quota_error_to_response(e),
        SubmitError::QuotaStore(e) => quota_store_error_to_response(e),
        e @ (SubmitError::Jobs(_) | SubmitError::Downloads(_)) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
        e @ SubmitError::Enqueue { .. } => json_error(StatusCode::BAD_GATEWAY, "enqueue_error", e.to_string()),
    }
}

pub fn lookup_error_to_response(err: LookupError) -> axum::response::Response {
    match err {
        LookupError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        LookupError::Forbidden => json_error(StatusCode::FORBIDDEN, "forbidden", "job belongs to another owner"),
        e @ (LookupError::Jobs(_) | LookupError::Downloads(_)) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}

pub fn cancel_error_to_response(err: CancelError) -> axum::response::Response {
    match err {
        CancelError::Lookup(e) => lookup_error_to_response(e),
        e @ CancelError::NotCancellable(_) => json_error(StatusCode::CONFLICT, "not_cancellable", e.to_string()),
        CancelError::Lifecycle(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string()),
    }
}

pub fn quota_error_to_response(err: QuotaError) -> axum::response::Response {
    match err {
        e @ QuotaError::UnknownAccount(_) => json_error(StatusCode::NOT_FOUND, "unknown_account", e.to_string()),
        e @ QuotaError::Exceeded { .. } => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "quota_exceeded", e.to_string())
        }
    }
}

pub fn quota_store_error_to_response(err: QuotaStoreError) -> axum::response::Response {
    match err {
        e @ QuotaStoreError::UnknownAccount(_) => {
            json_error(StatusCode::NOT_FOUND, "unknown_account", e.to_string())
        }
        QuotaStoreError::Storage(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
