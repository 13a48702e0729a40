use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use dirpack_core::JobId;
use dirpack_quota::{OwnerKey, QuotaSnapshot};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitDownloadRequest {
    /// Folder below the files root, as the owner sees it.
    pub path: String,
    pub quota_account_key: String,
    /// Size to debit. Measured from disk when omitted.
    pub size_bytes: Option<u64>,
    pub version_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAccountRequest {
    pub bytes_available: u64,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct QuotaResponse {
    pub owner_key: OwnerKey,
    pub bytes_available: u64,
    pub bytes_used: u64,
    pub bytes_remaining: u64,
}

impl QuotaResponse {
    pub fn new(owner_key: OwnerKey, snapshot: QuotaSnapshot) -> Self {
        Self {
            owner_key,
            bytes_available: snapshot.bytes_available,
            bytes_used: snapshot.bytes_used,
            bytes_remaining: snapshot.remaining(),
        }
    }
}

// -------------------------
// Parsing helpers
// -------------------------

pub const DEFAULT_HISTORY_LIMIT: usize = 20;
pub const MAX_HISTORY_LIMIT: usize = 100;

pub fn history_limit(query: &HistoryQuery) -> usize {
    query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT)
}

pub fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"))
}

pub fn parse_owner_key(raw: &str) -> Result<OwnerKey, axum::response::Response> {
    OwnerKey::new(raw).map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_owner_key", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_limit_is_clamped() {
        assert_eq!(history_limit(&HistoryQuery::default()), DEFAULT_HISTORY_LIMIT);
        assert_eq!(history_limit(&HistoryQuery { limit: Some(0) }), 1);
        assert_eq!(history_limit(&HistoryQuery { limit: Some(5_000) }), MAX_HISTORY_LIMIT);
    }
}
