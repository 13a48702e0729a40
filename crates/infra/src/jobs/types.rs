//! Job record model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dirpack_core::{DownloadHandleId, JobId, OwnerId, ReservationId};
use dirpack_quota::OwnerKey;

/// Lifecycle state of one archive request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(JobStatus::Queued),
            "in_progress" => Some(JobStatus::InProgress),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Counts against admission limits.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::InProgress)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted record of one submitted job.
///
/// Independent of the queue's own bookkeeping; the record is what terminal
/// handlers gate on and what owners see in their history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Queue-side id; a resubmission gets a new one.
    pub queue_job_id: String,
    pub queue_name: String,
    pub owner_id: OwnerId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub source_path: String,
    pub source_size_bytes: u64,
    pub quota_account_key: OwnerKey,
    pub quota_reservation_id: ReservationId,
    pub download_handle_id: DownloadHandleId,
    /// Content fingerprint the worker built (or reused), once known.
    pub version_key: Option<String>,
}

impl JobRecord {
    /// A freshly submitted record in `queued`.
    #[allow(clippy::too_many_arguments)]
    pub fn queued(
        id: JobId,
        queue_job_id: impl Into<String>,
        queue_name: impl Into<String>,
        owner_id: OwnerId,
        source_path: impl Into<String>,
        source_size_bytes: u64,
        quota_account_key: OwnerKey,
        download_handle_id: DownloadHandleId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            queue_job_id: queue_job_id.into(),
            queue_name: queue_name.into(),
            owner_id,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            finished_at: None,
            source_path: source_path.into(),
            source_size_bytes,
            quota_account_key,
            quota_reservation_id: ReservationId::new(),
            download_handle_id,
            version_key: None,
        }
    }
}
