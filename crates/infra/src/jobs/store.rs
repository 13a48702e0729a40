//! Job record storage.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use dirpack_core::{JobId, OwnerId};

use super::types::{JobRecord, JobStatus};

/// Job record store abstraction.
///
/// All status changes go through [`JobRecordStore::transition`], a single-row
/// compare-and-set. Whoever wins a transition owns its side effects
/// (compensation, notifications); losers do nothing.
pub trait JobRecordStore: Send + Sync {
    /// Insert a new record. Fails if the id already exists.
    fn insert(&self, job: JobRecord) -> Result<(), JobStoreError>;

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Most recently created record for a queue-side id.
    fn find_latest_by_queue_job(
        &self,
        queue_name: &str,
        queue_job_id: &str,
    ) -> Result<Option<JobRecord>, JobStoreError>;

    /// Move `id` from `from` to `to`. Returns `false` (and changes nothing)
    /// when the record is missing or not currently in `from`. Entering a
    /// terminal state stamps `finished_at`.
    fn transition(&self, id: JobId, from: JobStatus, to: JobStatus) -> Result<bool, JobStoreError>;

    /// Remember which content fingerprint the job resolved to.
    fn record_version_key(&self, id: JobId, version_key: &str) -> Result<(), JobStoreError>;

    /// Newest first.
    fn list_for_owner(&self, owner: OwnerId, limit: usize) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Jobs still `queued` that were created before `older_than`.
    fn list_stale_queued(&self, older_than: DateTime<Utc>) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Queued + in-progress jobs, for one owner or overall.
    fn count_active(&self, owner: Option<OwnerId>) -> Result<u64, JobStoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobRecordStore for InMemoryJobStore {
    fn insert(&self, job: JobRecord) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        Ok(self.jobs.read().unwrap().get(&id).cloned())
    }

    fn find_latest_by_queue_job(
        &self,
        queue_name: &str,
        queue_job_id: &str,
    ) -> Result<Option<JobRecord>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        Ok(jobs
            .values()
            .filter(|j| j.queue_name == queue_name && j.queue_job_id == queue_job_id)
            .max_by_key(|j| (j.created_at, j.id))
            .cloned())
    }

    fn transition(&self, id: JobId, from: JobStatus, to: JobStatus) -> Result<bool, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        match jobs.get_mut(&id) {
            Some(job) if job.status == from => {
                let now = Utc::now();
                job.status = to;
                job.updated_at = now;
                if to.is_terminal() {
                    job.finished_at = Some(now);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn record_version_key(&self, id: JobId, version_key: &str) -> Result<(), JobStoreError> {
        if let Some(job) = self.jobs.write().unwrap().get_mut(&id) {
            job.version_key = Some(version_key.to_string());
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    fn list_for_owner(&self, owner: OwnerId, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut result: Vec<_> = jobs.values().filter(|j| j.owner_id == owner).cloned().collect();
        result.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        result.truncate(limit);
        Ok(result)
    }

    fn list_stale_queued(&self, older_than: DateTime<Utc>) -> Result<Vec<JobRecord>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued && j.created_at < older_than)
            .cloned()
            .collect();
        result.sort_by_key(|j| j.created_at);
        Ok(result)
    }

    fn count_active(&self, owner: Option<OwnerId>) -> Result<u64, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        Ok(jobs
            .values()
            .filter(|j| j.status.is_active() && owner.is_none_or(|o| j.owner_id == o))
            .count() as u64)
    }
}
