//! Synchronous entry point of the pipeline: admit, debit, record, enqueue.
//!
//! Also hosts the owner-facing reads (job history, one job with its download
//! link, quota snapshot) and cancellation, since all of them need the same
//! ownership checks.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use dirpack_core::{DownloadHandleId, JobId, OwnerId};
use dirpack_events::JobEvent;
use dirpack_quota::{OwnerKey, QuotaError, QuotaPolicy, QuotaSnapshot};

use crate::config::PipelineConfig;
use crate::downloads::{DownloadHandle, DownloadStore, DownloadStoreError};
use crate::jobs::{JobRecord, JobRecordStore, JobStatus, JobStoreError};
use crate::ledger::{QuotaLedger, QuotaStoreError};
use crate::lifecycle::{JobLifecycle, LifecycleError};
use crate::queue::{JobMessage, JobQueue, QueueError};
use crate::supervisor::WorkerSupervisor;

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub owner_id: OwnerId,
    pub quota_account_key: OwnerKey,
    /// Path as the owner sees it; drives the cache key and bundle name.
    pub source_relative_path: String,
    /// Where the worker reads the folder from.
    pub source_absolute_path: String,
    pub estimated_size_bytes: u64,
    pub version_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub job_id: JobId,
    pub queue_job_id: String,
    pub download_handle_id: DownloadHandleId,
    pub queue_depth: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("owner {owner} already has {active} active job(s) (limit {limit})")]
    OwnerBusy { owner: OwnerId, active: u64, limit: u64 },
    #[error("pipeline is at capacity ({active} active jobs, limit {limit})")]
    PipelineBusy { active: u64, limit: u64 },
    #[error(transparent)]
    Quota(#[from] QuotaError),
    #[error(transparent)]
    QuotaStore(#[from] QuotaStoreError),
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
    #[error(transparent)]
    Downloads(#[from] DownloadStoreError),
    #[error("job {job_id} could not be enqueued: {source}")]
    Enqueue {
        job_id: JobId,
        #[source]
        source: QueueError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("job not found")]
    NotFound,
    #[error("job belongs to another owner")]
    Forbidden,
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
    #[error(transparent)]
    Downloads(#[from] DownloadStoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum CancelError {
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error("job is {0}, only in_progress jobs can be cancelled")]
    NotCancellable(JobStatus),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl From<JobStoreError> for CancelError {
    fn from(e: JobStoreError) -> Self {
        Self::Lookup(LookupError::Jobs(e))
    }
}

/// How a cancellation request names its job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRef {
    Record(JobId),
    /// Queue-side id; the newest record with it is authoritative.
    Queue(String),
}

/// A job as its owner sees it.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: JobRecord,
    /// Only while the bundle can still be fetched.
    pub download_url: Option<String>,
    pub download_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SubmissionSettings {
    pub quota_policy: QuotaPolicy,
    pub max_active_per_owner: u64,
    pub max_active_total: Option<u64>,
    pub queued_timeout: chrono::Duration,
}

impl SubmissionSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            quota_policy: config.quota_policy,
            max_active_per_owner: config.max_active_per_owner,
            max_active_total: config.max_active_total,
            queued_timeout: config.queued_timeout,
        }
    }
}

pub struct SubmissionService {
    lifecycle: Arc<JobLifecycle>,
    quota: Arc<dyn QuotaLedger>,
    downloads: Arc<dyn DownloadStore>,
    queue: Arc<dyn JobQueue>,
    supervisor: Option<Arc<WorkerSupervisor>>,
    settings: SubmissionSettings,
}

impl SubmissionService {
    pub fn new(
        lifecycle: Arc<JobLifecycle>,
        quota: Arc<dyn QuotaLedger>,
        downloads: Arc<dyn DownloadStore>,
        queue: Arc<dyn JobQueue>,
        settings: SubmissionSettings,
    ) -> Self {
        Self {
            lifecycle,
            quota,
            downloads,
            queue,
            supervisor: None,
            settings,
        }
    }

    /// Workers running in this process, so a cancel can stop the build itself.
    pub fn with_supervisor(mut self, supervisor: Arc<WorkerSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    fn jobs(&self) -> &Arc<dyn JobRecordStore> {
        self.lifecycle.jobs()
    }

    pub fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, SubmitError> {
        validate(&request)?;
        self.admit(request.owner_id)?;

        let key = &request.quota_account_key;
        let account = self
            .quota
            .account(key)?
            .ok_or_else(|| QuotaError::UnknownAccount(key.clone()))?;
        self.settings.quota_policy.admit(&account, request.estimated_size_bytes)?;

        let movement = self.quota.debit(key, request.estimated_size_bytes)?;
        info!(
            owner_id = %request.owner_id,
            owner_key = %key,
            debited = movement.applied,
            bytes_used = movement.bytes_used_after,
            "quota debited for submission"
        );

        let job_id = JobId::new();
        let handle = DownloadHandle::pending(DownloadHandleId::new(), job_id, request.owner_id);
        if let Err(e) = self.downloads.create(handle.clone()) {
            self.refund(key, request.estimated_size_bytes);
            return Err(e.into());
        }

        let queue_job_id = Uuid::now_v7().simple().to_string();
        let job = JobRecord::queued(
            job_id,
            queue_job_id.clone(),
            self.queue.queue_name(),
            request.owner_id,
            request.source_relative_path.clone(),
            request.estimated_size_bytes,
            key.clone(),
            handle.id,
        );
        if let Err(e) = self.jobs().insert(job.clone()) {
            self.refund(key, request.estimated_size_bytes);
            if let Err(e) = self.downloads.expire_now(handle.id, Utc::now()) {
                warn!(handle_id = %handle.id, error = %e, "failed to expire orphaned download handle");
            }
            return Err(e.into());
        }

        let message = JobMessage {
            source_folder_relative_path: request.source_relative_path,
            source_folder_absolute_path: request.source_absolute_path,
            owner_id: request.owner_id,
            job_record_id: job_id,
            download_handle_id: handle.id,
            source_size_bytes: request.estimated_size_bytes,
            quota_account_key: key.clone(),
            version_key: request.version_key,
        };
        if let Err(source) = self.queue.enqueue(&queue_job_id, &message) {
            error!(job_id = %job_id, error = %source, "enqueue failed; failing job");
            if let Err(e) = self.lifecycle.fail(&job, JobStatus::Queued) {
                error!(job_id = %job_id, error = %e, "could not fail unqueued job; reconciliation will retry");
            }
            return Err(SubmitError::Enqueue { job_id, source });
        }

        let queue_depth = self.queue.depth().unwrap_or_else(|e| {
            warn!(error = %e, "queue depth unavailable");
            0
        });
        self.lifecycle
            .notifier()
            .notify(request.owner_id, JobEvent::Queued { job_id, queue_depth });
        info!(job_id = %job_id, queue_job_id = %queue_job_id, owner_id = %request.owner_id, queue_depth, "job queued");

        Ok(SubmitReceipt {
            job_id,
            queue_job_id,
            download_handle_id: handle.id,
            queue_depth,
        })
    }

    /// Count-then-insert: concurrent submissions may overshoot a limit by a few.
    fn admit(&self, owner: OwnerId) -> Result<(), SubmitError> {
        let active = self.jobs().count_active(Some(owner))?;
        if active >= self.settings.max_active_per_owner {
            return Err(SubmitError::OwnerBusy {
                owner,
                active,
                limit: self.settings.max_active_per_owner,
            });
        }
        if let Some(limit) = self.settings.max_active_total {
            let active = self.jobs().count_active(None)?;
            if active >= limit {
                return Err(SubmitError::PipelineBusy { active, limit });
            }
        }
        Ok(())
    }

    fn refund(&self, key: &OwnerKey, bytes: u64) {
        if let Err(e) = self.quota.credit(key, bytes) {
            error!(owner_key = %key, bytes, error = %e, "refund after rejected submission failed");
        }
    }

    fn resolve(&self, job: &JobRef) -> Result<JobRecord, LookupError> {
        let record = match job {
            JobRef::Record(id) => self.jobs().get(*id)?,
            JobRef::Queue(queue_job_id) => self
                .jobs()
                .find_latest_by_queue_job(self.queue.queue_name(), queue_job_id)?,
        };
        record.ok_or(LookupError::NotFound)
    }

    fn owned(&self, job: &JobRef, owner: OwnerId) -> Result<JobRecord, LookupError> {
        let record = self.resolve(job)?;
        if record.owner_id != owner {
            return Err(LookupError::Forbidden);
        }
        Ok(record)
    }

    /// Cancel an `in_progress` job belonging to `owner`.
    pub fn cancel(&self, job: JobRef, owner: OwnerId) -> Result<JobRecord, CancelError> {
        let record = self.owned(&job, owner)?;
        if record.status != JobStatus::InProgress {
            return Err(CancelError::NotCancellable(record.status));
        }

        let signalled = self.supervisor.as_ref().is_some_and(|s| s.cancel(record.id));
        if !self.lifecycle.cancel(&record)? {
            let current = self.jobs().get(record.id)?.unwrap_or(record);
            // The signalled worker may reach the transition first.
            if current.status == JobStatus::Cancelled {
                info!(job_id = %current.id, owner_id = %owner, "cancellation completed by the running worker");
                return Ok(current);
            }
            return Err(CancelError::NotCancellable(current.status));
        }
        info!(job_id = %record.id, owner_id = %owner, signalled_local_worker = signalled, "cancellation accepted");

        Ok(self.jobs().get(record.id)?.unwrap_or(record))
    }

    pub fn job(&self, job_id: JobId, owner: OwnerId) -> Result<JobView, LookupError> {
        let job = self.owned(&JobRef::Record(job_id), owner)?;
        self.view(job)
    }

    /// Newest first.
    pub fn history(&self, owner: OwnerId, limit: usize) -> Result<Vec<JobView>, LookupError> {
        self.jobs()
            .list_for_owner(owner, limit)?
            .into_iter()
            .map(|job| self.view(job))
            .collect()
    }

    fn view(&self, job: JobRecord) -> Result<JobView, LookupError> {
        let now = Utc::now();
        let handle = self.downloads.get(job.download_handle_id)?;
        let download_url = handle
            .as_ref()
            .and_then(|h| h.usable_url(now))
            .map(str::to_string);
        let download_expires_at = handle.and_then(|h| h.expires_at);
        Ok(JobView {
            job,
            download_url,
            download_expires_at,
        })
    }

    pub fn quota(&self, key: &OwnerKey) -> Result<Option<QuotaSnapshot>, QuotaStoreError> {
        self.quota.snapshot(key)
    }

    /// Fail jobs stuck in `queued` past the timeout (e.g. enqueue lost after
    /// the record was written). Returns how many were failed here.
    pub fn reconcile_stale_queued(&self, now: DateTime<Utc>) -> Result<usize, LifecycleError> {
        let stale = self.jobs().list_stale_queued(now - self.settings.queued_timeout)?;
        let mut failed = 0;
        for job in stale {
            if self.lifecycle.fail(&job, JobStatus::Queued)? {
                warn!(job_id = %job.id, created_at = %job.created_at, "stale queued job failed by reconciliation");
                failed += 1;
            }
        }
        Ok(failed)
    }
}

fn validate(request: &SubmitRequest) -> Result<(), SubmitError> {
    if request.source_relative_path.trim().is_empty() {
        return Err(SubmitError::Validation("source path must not be blank".into()));
    }
    if !std::path::Path::new(&request.source_absolute_path).is_absolute() {
        return Err(SubmitError::Validation(format!(
            "source folder `{}` is not an absolute path",
            request.source_absolute_path
        )));
    }
    if request.version_key.as_deref().is_some_and(|v| v.trim().is_empty()) {
        return Err(SubmitError::Validation("version key must not be blank".into()));
    }
    Ok(())
}
