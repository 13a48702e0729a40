//! Status-gated job transitions and their side effects.
//!
//! Every terminal handler first wins a compare-and-set on the job record and
//! only then touches quota, download handles, or the real-time channel. Two
//! actors racing for the same job (duplicate delivery, cancel vs. finish)
//! therefore produce exactly one compensation and one terminal event.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use dirpack_core::JobId;
use dirpack_events::JobEvent;

use crate::downloads::{DownloadStore, DownloadStoreError, download_url};
use crate::event_bus::Notifier;
use crate::jobs::{JobRecord, JobRecordStore, JobStatus, JobStoreError};
use crate::ledger::QuotaLedger;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
    #[error(transparent)]
    Downloads(#[from] DownloadStoreError),
}

/// Result of picking up a delivered job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    /// `queued` -> `in_progress` by this call.
    Started(JobRecord),
    /// Already `in_progress` from an earlier delivery; run it again.
    Resumed(JobRecord),
    /// Nothing to do; a redelivery after the job finished.
    AlreadyTerminal(JobRecord),
    Missing,
}

pub struct JobLifecycle {
    jobs: Arc<dyn JobRecordStore>,
    quota: Arc<dyn QuotaLedger>,
    downloads: Arc<dyn DownloadStore>,
    notifier: Arc<dyn Notifier>,
    backend_url: String,
    download_ttl: chrono::Duration,
}

impl JobLifecycle {
    pub fn new(
        jobs: Arc<dyn JobRecordStore>,
        quota: Arc<dyn QuotaLedger>,
        downloads: Arc<dyn DownloadStore>,
        notifier: Arc<dyn Notifier>,
        backend_url: impl Into<String>,
        download_ttl: chrono::Duration,
    ) -> Self {
        Self {
            jobs,
            quota,
            downloads,
            notifier,
            backend_url: backend_url.into(),
            download_ttl,
        }
    }

    pub fn jobs(&self) -> &Arc<dyn JobRecordStore> {
        &self.jobs
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn begin(&self, job_id: JobId) -> Result<BeginOutcome, LifecycleError> {
        let Some(job) = self.jobs.get(job_id)? else {
            warn!(job_id = %job_id, "job record missing for delivered message");
            return Ok(BeginOutcome::Missing);
        };

        match job.status {
            JobStatus::Queued => {
                if self.jobs.transition(job_id, JobStatus::Queued, JobStatus::InProgress)? {
                    let mut job = job;
                    job.status = JobStatus::InProgress;
                    info!(job_id = %job_id, owner_id = %job.owner_id, "job started");
                    return Ok(BeginOutcome::Started(job));
                }
                // Lost to a concurrent actor; classify whatever it left behind.
                match self.jobs.get(job_id)? {
                    Some(current) if current.status == JobStatus::InProgress => Ok(BeginOutcome::Resumed(current)),
                    Some(current) => Ok(BeginOutcome::AlreadyTerminal(current)),
                    None => Ok(BeginOutcome::Missing),
                }
            }
            JobStatus::InProgress => {
                info!(job_id = %job_id, "resuming job from an earlier delivery");
                Ok(BeginOutcome::Resumed(job))
            }
            _ => {
                debug!(job_id = %job_id, status = %job.status, "ignoring redelivery of finished job");
                Ok(BeginOutcome::AlreadyTerminal(job))
            }
        }
    }

    /// Publish the bundle to the owner and mark the job `completed`.
    ///
    /// The handle is filled in before the transition so a `completed` job
    /// always has a URL. If the transition is lost (cancelled meanwhile) the
    /// handle is expired again and `false` is returned.
    pub fn complete(&self, job: &JobRecord, bundle_name: &str) -> Result<bool, LifecycleError> {
        let now = Utc::now();
        let url = download_url(&self.backend_url, bundle_name, job.id);
        if !self
            .downloads
            .complete(job.download_handle_id, &url, bundle_name, now + self.download_ttl)?
        {
            warn!(job_id = %job.id, handle_id = %job.download_handle_id, "download handle missing at completion");
        }

        if !self.jobs.transition(job.id, JobStatus::InProgress, JobStatus::Completed)? {
            info!(job_id = %job.id, "completion lost to a concurrent transition");
            self.downloads.expire_now(job.download_handle_id, Utc::now())?;
            return Ok(false);
        }

        info!(job_id = %job.id, owner_id = %job.owner_id, bundle = %bundle_name, "job completed");
        self.notifier.notify(
            job.owner_id,
            JobEvent::Completed {
                job_id: job.id,
                download_url: url,
            },
        );
        Ok(true)
    }

    /// Mark the job `failed` from `from` and give its quota back.
    pub fn fail(&self, job: &JobRecord, from: JobStatus) -> Result<bool, LifecycleError> {
        if !self.jobs.transition(job.id, from, JobStatus::Failed)? {
            debug!(job_id = %job.id, from = %from, "failure transition already taken");
            return Ok(false);
        }
        self.compensate(job);
        self.notifier.notify(job.owner_id, JobEvent::Failed { job_id: job.id });
        Ok(true)
    }

    /// Mark an in-progress job `cancelled`, give its quota back and expire
    /// its download handle.
    pub fn cancel(&self, job: &JobRecord) -> Result<bool, LifecycleError> {
        if !self.jobs.transition(job.id, JobStatus::InProgress, JobStatus::Cancelled)? {
            debug!(job_id = %job.id, "cancel transition already taken");
            return Ok(false);
        }
        self.compensate(job);
        if let Err(e) = self.downloads.expire_now(job.download_handle_id, Utc::now()) {
            error!(job_id = %job.id, error = %e, "failed to expire download handle of cancelled job");
        }
        info!(job_id = %job.id, owner_id = %job.owner_id, "job cancelled");
        self.notifier.notify(job.owner_id, JobEvent::Cancelled { job_id: job.id });
        Ok(true)
    }

    /// Only ever called by the winner of a terminal transition.
    fn compensate(&self, job: &JobRecord) {
        match self.quota.credit(&job.quota_account_key, job.source_size_bytes) {
            Ok(movement) => info!(
                job_id = %job.id,
                owner_key = %job.quota_account_key,
                credited = movement.applied,
                clamped = movement.was_clamped(),
                bytes_used = movement.bytes_used_after,
                "quota compensated"
            ),
            Err(e) => error!(
                job_id = %job.id,
                owner_key = %job.quota_account_key,
                bytes = job.source_size_bytes,
                error = %e,
                "quota compensation failed; ledger needs operator attention"
            ),
        }
    }
}
