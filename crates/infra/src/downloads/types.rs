use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};

use dirpack_core::{DownloadHandleId, JobId, OwnerId};

/// Characters left as-is in the `name` query parameter (RFC 3986 unreserved).
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Links a job to its retrievable bundle.
///
/// Created (without a URL) at submission; filled in when the job completes.
/// Cancelling a job moves `expires_at` to "now".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadHandle {
    pub id: DownloadHandleId,
    pub job_id: JobId,
    pub owner_id: OwnerId,
    pub bundle_name: Option<String>,
    pub download_url: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadHandle {
    pub fn pending(id: DownloadHandleId, job_id: JobId, owner_id: OwnerId) -> Self {
        let now = Utc::now();
        Self {
            id,
            job_id,
            owner_id,
            bundle_name: None,
            download_url: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// A URL that can be handed out right now.
    pub fn usable_url(&self, now: DateTime<Utc>) -> Option<&str> {
        if self.is_expired(now) {
            return None;
        }
        self.download_url.as_deref()
    }
}

/// `<base>/download-dir?name=<bundle>&jobId=<job>`; callers append auth.
pub fn download_url(base: &str, bundle_name: &str, job_id: JobId) -> String {
    format!(
        "{}/download-dir?name={}&jobId={}",
        base.trim_end_matches('/'),
        utf8_percent_encode(bundle_name, QUERY_VALUE),
        job_id
    )
}
