//! Postgres-backed job record store (`archive_jobs` table).

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use tracing::instrument;

use dirpack_core::{DownloadHandleId, JobId, OwnerId, ReservationId};
use dirpack_quota::OwnerKey;

use super::store::{JobRecordStore, JobStoreError};
use super::types::{JobRecord, JobStatus};
use crate::pg::{self, PgRuntime};

const COLUMNS: &str = "id, queue_job_id, queue_name, owner_id, status, created_at, updated_at, \
    finished_at, source_path, source_size_bytes, quota_account_key, quota_reservation_id, \
    download_handle_id, version_key";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    rt: PgRuntime,
}

impl PostgresJobStore {
    pub fn new(rt: PgRuntime) -> Self {
        Self { rt }
    }
}

fn storage(operation: &str) -> impl FnOnce(sqlx::Error) -> JobStoreError + '_ {
    move |e| JobStoreError::Storage(pg::describe(operation, e))
}

fn row_to_record(row: &PgRow) -> Result<JobRecord, JobStoreError> {
    let decode = |e: sqlx::Error| JobStoreError::Storage(format!("failed to decode job row: {e}"));
    let status_raw: String = row.try_get("status").map_err(decode)?;
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| JobStoreError::Storage(format!("unknown job status `{status_raw}`")))?;
    let key_raw: String = row.try_get("quota_account_key").map_err(decode)?;
    let quota_account_key =
        OwnerKey::new(key_raw).map_err(|e| JobStoreError::Storage(e.to_string()))?;

    Ok(JobRecord {
        id: JobId::from_uuid(row.try_get("id").map_err(decode)?),
        queue_job_id: row.try_get("queue_job_id").map_err(decode)?,
        queue_name: row.try_get("queue_name").map_err(decode)?,
        owner_id: OwnerId::from_uuid(row.try_get("owner_id").map_err(decode)?),
        status,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
        finished_at: row.try_get("finished_at").map_err(decode)?,
        source_path: row.try_get("source_path").map_err(decode)?,
        source_size_bytes: pg::from_db_bytes(row.try_get("source_size_bytes").map_err(decode)?),
        quota_account_key,
        quota_reservation_id: ReservationId::from_uuid(
            row.try_get("quota_reservation_id").map_err(decode)?,
        ),
        download_handle_id: DownloadHandleId::from_uuid(
            row.try_get("download_handle_id").map_err(decode)?,
        ),
        version_key: row.try_get("version_key").map_err(decode)?,
    })
}

impl JobRecordStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    fn insert(&self, job: JobRecord) -> Result<(), JobStoreError> {
        let result = self.rt.block_on(
            sqlx::query(
                r#"
                INSERT INTO archive_jobs (
                    id, queue_job_id, queue_name, owner_id, status, created_at, updated_at,
                    finished_at, source_path, source_size_bytes, quota_account_key,
                    quota_reservation_id, download_handle_id, version_key
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                "#,
            )
            .bind(job.id.as_uuid())
            .bind(&job.queue_job_id)
            .bind(&job.queue_name)
            .bind(job.owner_id.as_uuid())
            .bind(job.status.as_str())
            .bind(job.created_at)
            .bind(job.updated_at)
            .bind(job.finished_at)
            .bind(&job.source_path)
            .bind(pg::to_db_bytes(job.source_size_bytes))
            .bind(job.quota_account_key.as_str())
            .bind(job.quota_reservation_id.as_uuid())
            .bind(job.download_handle_id.as_uuid())
            .bind(&job.version_key)
            .execute(self.rt.pool()),
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if pg::is_unique_violation(&e) => Err(JobStoreError::AlreadyExists(job.id)),
            Err(e) => Err(storage("insert_job")(e)),
        }
    }

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM archive_jobs WHERE id = $1");
        let row = self
            .rt
            .block_on(sqlx::query(&sql).bind(id.as_uuid()).fetch_optional(self.rt.pool()))
            .map_err(storage("get_job"))?;
        row.as_ref().map(row_to_record).transpose()
    }

    fn find_latest_by_queue_job(
        &self,
        queue_name: &str,
        queue_job_id: &str,
    ) -> Result<Option<JobRecord>, JobStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM archive_jobs \
             WHERE queue_name = $1 AND queue_job_id = $2 \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        let row = self
            .rt
            .block_on(
                sqlx::query(&sql)
                    .bind(queue_name)
                    .bind(queue_job_id)
                    .fetch_optional(self.rt.pool()),
            )
            .map_err(storage("find_latest_by_queue_job"))?;
        row.as_ref().map(row_to_record).transpose()
    }

    #[instrument(skip(self), fields(job_id = %id, from = %from, to = %to), err)]
    fn transition(&self, id: JobId, from: JobStatus, to: JobStatus) -> Result<bool, JobStoreError> {
        let result = self
            .rt
            .block_on(
                sqlx::query(
                    r#"
                    UPDATE archive_jobs
                    SET status = $3,
                        updated_at = now(),
                        finished_at = CASE WHEN $4 THEN now() ELSE finished_at END
                    WHERE id = $1 AND status = $2
                    "#,
                )
                .bind(id.as_uuid())
                .bind(from.as_str())
                .bind(to.as_str())
                .bind(to.is_terminal())
                .execute(self.rt.pool()),
            )
            .map_err(storage("transition_job"))?;
        Ok(result.rows_affected() == 1)
    }

    fn record_version_key(&self, id: JobId, version_key: &str) -> Result<(), JobStoreError> {
        self.rt
            .block_on(
                sqlx::query(
                    "UPDATE archive_jobs SET version_key = $2, updated_at = now() WHERE id = $1",
                )
                .bind(id.as_uuid())
                .bind(version_key)
                .execute(self.rt.pool()),
            )
            .map_err(storage("record_version_key"))?;
        Ok(())
    }

    fn list_for_owner(&self, owner: OwnerId, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM archive_jobs WHERE owner_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2"
        );
        let rows = self
            .rt
            .block_on(
                sqlx::query(&sql)
                    .bind(owner.as_uuid())
                    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
                    .fetch_all(self.rt.pool()),
            )
            .map_err(storage("list_for_owner"))?;
        rows.iter().map(row_to_record).collect()
    }

    fn list_stale_queued(&self, older_than: DateTime<Utc>) -> Result<Vec<JobRecord>, JobStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM archive_jobs WHERE status = 'queued' AND created_at < $1 \
             ORDER BY created_at ASC"
        );
        let rows = self
            .rt
            .block_on(sqlx::query(&sql).bind(older_than).fetch_all(self.rt.pool()))
            .map_err(storage("list_stale_queued"))?;
        rows.iter().map(row_to_record).collect()
    }

    fn count_active(&self, owner: Option<OwnerId>) -> Result<u64, JobStoreError> {
        let row = self
            .rt
            .block_on(
                sqlx::query(
                    r#"
                    SELECT COUNT(*) AS active
                    FROM archive_jobs
                    WHERE status IN ('queued', 'in_progress')
                      AND ($1::uuid IS NULL OR owner_id = $1)
                    "#,
                )
                .bind(owner.map(|o| *o.as_uuid()))
                .fetch_one(self.rt.pool()),
            )
            .map_err(storage("count_active"))?;
        let active: i64 = row
            .try_get("active")
            .map_err(|e| JobStoreError::Storage(e.to_string()))?;
        Ok(pg::from_db_bytes(active))
    }
}
