use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use uuid::Uuid;

use dirpack_core::{JobId, OwnerId};

/// Prefix shared by every job notification topic.
pub const TOPIC_PREFIX: &str = "compression";

/// A job notification as seen by the real-time channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEvent {
    /// Accepted by the submission API and waiting for a worker.
    Queued { job_id: JobId, queue_depth: usize },
    /// Build progress, integer percentage in `0..=100`.
    Progress { job_id: JobId, progress: u8 },
    /// Bundle ready for download.
    Completed { job_id: JobId, download_url: String },
    Failed { job_id: JobId },
    Cancelled { job_id: JobId },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Queued { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Failed { job_id }
            | JobEvent::Cancelled { job_id } => *job_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobEvent::Queued { .. } => "queued",
            JobEvent::Progress { .. } => "progress",
            JobEvent::Completed { .. } => "completed",
            JobEvent::Failed { .. } => "failed",
            JobEvent::Cancelled { .. } => "cancelled",
        }
    }

    /// Terminal events close a job's stream; nothing may follow them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Completed { .. } | JobEvent::Failed { .. } | JobEvent::Cancelled { .. }
        )
    }

    /// Client-facing body, camelCase keys.
    pub fn body(&self) -> JsonValue {
        match self {
            JobEvent::Queued { job_id, queue_depth } => json!({
                "jobId": job_id.to_string(),
                "progress": 0,
                "queueDepth": queue_depth,
            }),
            JobEvent::Progress { job_id, progress } => json!({
                "jobId": job_id.to_string(),
                "progress": progress,
            }),
            JobEvent::Completed { job_id, download_url } => json!({
                "jobId": job_id.to_string(),
                "downloadUrl": download_url,
            }),
            JobEvent::Failed { job_id } | JobEvent::Cancelled { job_id } => json!({
                "jobId": job_id.to_string(),
            }),
        }
    }
}

/// Envelope published on the real-time channel: one topic per owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEvent {
    event_id: Uuid,
    owner_id: OwnerId,
    occurred_at: DateTime<Utc>,
    event: JobEvent,
}

impl ChannelEvent {
    pub fn new(owner_id: OwnerId, event: JobEvent) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            owner_id,
            occurred_at: Utc::now(),
            event,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn owner_id(&self) -> OwnerId {
        self.owner_id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn event(&self) -> &JobEvent {
        &self.event
    }

    pub fn into_event(self) -> JobEvent {
        self.event
    }

    /// Topic name, e.g. `compression:progress:<owner>`.
    pub fn topic(&self) -> String {
        format!("{}:{}:{}", TOPIC_PREFIX, self.event.kind(), self.owner_id)
    }
}
