//! Postgres download handles (`download_handles` table).

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;

use dirpack_core::{DownloadHandleId, JobId, OwnerId};

use super::store::{DownloadStore, DownloadStoreError};
use super::types::DownloadHandle;
use crate::pg::{self, PgRuntime};

#[derive(Debug, Clone)]
pub struct PostgresDownloadStore {
    rt: PgRuntime,
}

impl PostgresDownloadStore {
    pub fn new(rt: PgRuntime) -> Self {
        Self { rt }
    }
}

fn storage(operation: &'static str) -> impl FnOnce(sqlx::Error) -> DownloadStoreError {
    move |e| DownloadStoreError::Storage(pg::describe(operation, e))
}

fn row_to_handle(row: &PgRow) -> Result<DownloadHandle, DownloadStoreError> {
    let decode = |e: sqlx::Error| DownloadStoreError::Storage(format!("failed to decode download handle: {e}"));
    Ok(DownloadHandle {
        id: DownloadHandleId::from_uuid(row.try_get("id").map_err(decode)?),
        job_id: JobId::from_uuid(row.try_get("job_id").map_err(decode)?),
        owner_id: OwnerId::from_uuid(row.try_get("owner_id").map_err(decode)?),
        bundle_name: row.try_get("bundle_name").map_err(decode)?,
        download_url: row.try_get("download_url").map_err(decode)?,
        expires_at: row.try_get("expires_at").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

impl DownloadStore for PostgresDownloadStore {
    fn create(&self, handle: DownloadHandle) -> Result<(), DownloadStoreError> {
        let result = self.rt.block_on(
            sqlx::query(
                r#"
                INSERT INTO download_handles (
                    id, job_id, owner_id, bundle_name, download_url, expires_at, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(handle.id.as_uuid())
            .bind(handle.job_id.as_uuid())
            .bind(handle.owner_id.as_uuid())
            .bind(&handle.bundle_name)
            .bind(&handle.download_url)
            .bind(handle.expires_at)
            .bind(handle.created_at)
            .bind(handle.updated_at)
            .execute(self.rt.pool()),
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if pg::is_unique_violation(&e) => Err(DownloadStoreError::AlreadyExists(handle.id)),
            Err(e) => Err(storage("create_download_handle")(e)),
        }
    }

    fn get(&self, id: DownloadHandleId) -> Result<Option<DownloadHandle>, DownloadStoreError> {
        let row = self
            .rt
            .block_on(
                sqlx::query(
                    "SELECT id, job_id, owner_id, bundle_name, download_url, expires_at, created_at, updated_at \
                     FROM download_handles WHERE id = $1",
                )
                .bind(id.as_uuid())
                .fetch_optional(self.rt.pool()),
            )
            .map_err(storage("get_download_handle"))?;
        row.as_ref().map(row_to_handle).transpose()
    }

    fn complete(
        &self,
        id: DownloadHandleId,
        download_url: &str,
        bundle_name: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DownloadStoreError> {
        let result = self
            .rt
            .block_on(
                sqlx::query(
                    "UPDATE download_handles \
                     SET download_url = $2, bundle_name = $3, expires_at = $4, updated_at = now() \
                     WHERE id = $1",
                )
                .bind(id.as_uuid())
                .bind(download_url)
                .bind(bundle_name)
                .bind(expires_at)
                .execute(self.rt.pool()),
            )
            .map_err(storage("complete_download_handle"))?;
        Ok(result.rows_affected() == 1)
    }

    fn expire_now(&self, id: DownloadHandleId, now: DateTime<Utc>) -> Result<bool, DownloadStoreError> {
        let result = self
            .rt
            .block_on(
                sqlx::query("UPDATE download_handles SET expires_at = $2, updated_at = $2 WHERE id = $1")
                    .bind(id.as_uuid())
                    .bind(now)
                    .execute(self.rt.pool()),
            )
            .map_err(storage("expire_download_handle"))?;
        Ok(result.rows_affected() == 1)
    }

    fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DownloadHandle>, DownloadStoreError> {
        let rows = self
            .rt
            .block_on(
                sqlx::query(
                    "SELECT id, job_id, owner_id, bundle_name, download_url, expires_at, created_at, updated_at \
                     FROM download_handles \
                     WHERE expires_at IS NOT NULL AND expires_at <= $1 AND bundle_name IS NOT NULL \
                     ORDER BY expires_at ASC \
                     LIMIT $2",
                )
                .bind(now)
                .bind(i64::try_from(limit).unwrap_or(i64::MAX))
                .fetch_all(self.rt.pool()),
            )
            .map_err(storage("list_expired_download_handles"))?;
        rows.iter().map(row_to_handle).collect()
    }

    fn release_bundle(&self, id: DownloadHandleId, now: DateTime<Utc>) -> Result<bool, DownloadStoreError> {
        let result = self
            .rt
            .block_on(
                sqlx::query(
                    "UPDATE download_handles \
                     SET bundle_name = NULL, download_url = NULL, updated_at = $2 \
                     WHERE id = $1 AND expires_at IS NOT NULL AND expires_at <= $2",
                )
                .bind(id.as_uuid())
                .bind(now)
                .execute(self.rt.pool()),
            )
            .map_err(storage("release_download_bundle"))?;
        Ok(result.rows_affected() == 1)
    }
}
