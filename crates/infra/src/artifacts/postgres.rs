//! Postgres artifact registry (`zip_artifacts` table, keyed by
//! `(folder_key, version_key)`).

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use tracing::debug;

use dirpack_archive::{FolderKey, VersionKey};

use super::cache::{ArtifactCache, ArtifactCacheError};
use super::types::{
    ArtifactMeta, ArtifactRecord, ArtifactStatus, ArtifactTier, ClaimOutcome, ClaimToken,
};
use crate::pg::{self, PgRuntime};

const COLUMNS: &str = "folder_key, version_key, artifact_name, status, source_size_bytes, \
    artifact_size_bytes, tier, hit_count, error_summary, claim_token, created_at, updated_at, expires_at";

#[derive(Debug, Clone)]
pub struct PostgresArtifactCache {
    rt: PgRuntime,
}

impl PostgresArtifactCache {
    pub fn new(rt: PgRuntime) -> Self {
        Self { rt }
    }
}

fn storage(operation: &'static str) -> impl FnOnce(sqlx::Error) -> ArtifactCacheError {
    move |e| ArtifactCacheError::Storage(pg::describe(operation, e))
}

fn row_to_record(row: &PgRow) -> Result<ArtifactRecord, ArtifactCacheError> {
    let decode = |e: sqlx::Error| ArtifactCacheError::Storage(format!("failed to decode artifact row: {e}"));
    let status_raw: String = row.try_get("status").map_err(decode)?;
    let tier_raw: String = row.try_get("tier").map_err(decode)?;
    let version_raw: String = row.try_get("version_key").map_err(decode)?;
    let folder_raw: String = row.try_get("folder_key").map_err(decode)?;

    Ok(ArtifactRecord {
        folder_key: FolderKey::normalize(&folder_raw),
        version_key: VersionKey::explicit(&version_raw)
            .map_err(|e| ArtifactCacheError::Storage(e.to_string()))?,
        artifact_name: row.try_get("artifact_name").map_err(decode)?,
        status: ArtifactStatus::parse(&status_raw)
            .ok_or_else(|| ArtifactCacheError::Storage(format!("unknown artifact status `{status_raw}`")))?,
        source_size_bytes: pg::from_db_bytes(row.try_get("source_size_bytes").map_err(decode)?),
        artifact_size_bytes: row
            .try_get::<Option<i64>, _>("artifact_size_bytes")
            .map_err(decode)?
            .map(pg::from_db_bytes),
        tier: ArtifactTier::parse(&tier_raw).unwrap_or_default(),
        hit_count: pg::from_db_bytes(row.try_get("hit_count").map_err(decode)?),
        error_summary: row.try_get("error_summary").map_err(decode)?,
        claim_token: row
            .try_get::<Option<uuid::Uuid>, _>("claim_token")
            .map_err(decode)?
            .map(ClaimToken::from_uuid),
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
        expires_at: row.try_get("expires_at").map_err(decode)?,
    })
}

impl ArtifactCache for PostgresArtifactCache {
    fn get(&self, folder: &FolderKey, version: &VersionKey) -> Result<Option<ArtifactRecord>, ArtifactCacheError> {
        let sql = format!("SELECT {COLUMNS} FROM zip_artifacts WHERE folder_key = $1 AND version_key = $2");
        let row = self
            .rt
            .block_on(
                sqlx::query(&sql)
                    .bind(folder.as_str())
                    .bind(version.as_str())
                    .fetch_optional(self.rt.pool()),
            )
            .map_err(storage("get_artifact"))?;
        row.as_ref().map(row_to_record).transpose()
    }

    fn claim_building(
        &self,
        folder: &FolderKey,
        version: &VersionKey,
        meta: &ArtifactMeta,
        stale_before: DateTime<Utc>,
    ) -> Result<ClaimOutcome, ArtifactCacheError> {
        let token = ClaimToken::new();
        // The conflict branch only fires for failed or stale rows; otherwise
        // nothing is returned and the caller reads the current holder.
        let claimed = self
            .rt
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO zip_artifacts (
                        folder_key, version_key, artifact_name, status, source_size_bytes,
                        tier, hit_count, claim_token, created_at, updated_at
                    )
                    VALUES ($1, $2, $3, 'building', $4, $5, 0, $6, now(), now())
                    ON CONFLICT (folder_key, version_key) DO UPDATE
                    SET status = 'building',
                        artifact_name = EXCLUDED.artifact_name,
                        source_size_bytes = EXCLUDED.source_size_bytes,
                        tier = EXCLUDED.tier,
                        artifact_size_bytes = NULL,
                        error_summary = NULL,
                        expires_at = NULL,
                        claim_token = EXCLUDED.claim_token,
                        created_at = now(),
                        updated_at = now()
                    WHERE zip_artifacts.status = 'failed'
                       OR (zip_artifacts.status = 'building' AND zip_artifacts.updated_at < $7)
                    RETURNING claim_token
                    "#,
                )
                .bind(folder.as_str())
                .bind(version.as_str())
                .bind(&meta.artifact_name)
                .bind(pg::to_db_bytes(meta.source_size_bytes))
                .bind(meta.tier.as_str())
                .bind(token.as_uuid())
                .bind(stale_before)
                .fetch_optional(self.rt.pool()),
            )
            .map_err(storage("claim_building"))?;

        if claimed.is_some() {
            return Ok(ClaimOutcome::Claimed(token));
        }

        let state = self.get_state(folder, version)?;
        debug!(folder_key = %folder, version_key = %version, ?state, "artifact claim held elsewhere");
        Ok(ClaimOutcome::Held(state))
    }

    fn mark_ready(
        &self,
        folder: &FolderKey,
        version: &VersionKey,
        token: ClaimToken,
        artifact_size_bytes: u64,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, ArtifactCacheError> {
        let result = self
            .rt
            .block_on(
                sqlx::query(
                    r#"
                    UPDATE zip_artifacts
                    SET status = 'ready', artifact_size_bytes = $4, error_summary = NULL,
                        claim_token = NULL, expires_at = $5, updated_at = now()
                    WHERE folder_key = $1 AND version_key = $2
                      AND status = 'building' AND claim_token = $3
                    "#,
                )
                .bind(folder.as_str())
                .bind(version.as_str())
                .bind(token.as_uuid())
                .bind(pg::to_db_bytes(artifact_size_bytes))
                .bind(expires_at)
                .execute(self.rt.pool()),
            )
            .map_err(storage("mark_ready"))?;
        Ok(result.rows_affected() == 1)
    }

    fn mark_failed(
        &self,
        folder: &FolderKey,
        version: &VersionKey,
        token: ClaimToken,
        error_summary: &str,
    ) -> Result<bool, ArtifactCacheError> {
        let result = self
            .rt
            .block_on(
                sqlx::query(
                    r#"
                    UPDATE zip_artifacts
                    SET status = 'failed', error_summary = $4, claim_token = NULL,
                        expires_at = now(), updated_at = now()
                    WHERE folder_key = $1 AND version_key = $2
                      AND status = 'building' AND claim_token = $3
                    "#,
                )
                .bind(folder.as_str())
                .bind(version.as_str())
                .bind(token.as_uuid())
                .bind(error_summary)
                .execute(self.rt.pool()),
            )
            .map_err(storage("mark_failed"))?;
        Ok(result.rows_affected() == 1)
    }

    fn touch(
        &self,
        folder: &FolderKey,
        version: &VersionKey,
        tier: ArtifactTier,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ArtifactCacheError> {
        self.rt
            .block_on(
                sqlx::query(
                    r#"
                    UPDATE zip_artifacts
                    SET hit_count = hit_count + 1, tier = $3, expires_at = $4, updated_at = now()
                    WHERE folder_key = $1 AND version_key = $2 AND status = 'ready'
                    "#,
                )
                .bind(folder.as_str())
                .bind(version.as_str())
                .bind(tier.as_str())
                .bind(expires_at)
                .execute(self.rt.pool()),
            )
            .map_err(storage("touch"))?;
        Ok(())
    }

    fn popularity(&self, folder: &FolderKey) -> Result<u64, ArtifactCacheError> {
        let row = self
            .rt
            .block_on(
                sqlx::query("SELECT COALESCE(SUM(hit_count), 0)::BIGINT AS hits FROM zip_artifacts WHERE folder_key = $1")
                    .bind(folder.as_str())
                    .fetch_one(self.rt.pool()),
            )
            .map_err(storage("popularity"))?;
        let hits: i64 = row
            .try_get("hits")
            .map_err(|e| ArtifactCacheError::Storage(e.to_string()))?;
        Ok(pg::from_db_bytes(hits))
    }

    fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ArtifactRecord>, ArtifactCacheError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM zip_artifacts \
             WHERE status IN ('ready', 'failed') AND expires_at <= $1 \
             ORDER BY expires_at ASC LIMIT $2"
        );
        let rows = self
            .rt
            .block_on(
                sqlx::query(&sql)
                    .bind(now)
                    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
                    .fetch_all(self.rt.pool()),
            )
            .map_err(storage("list_expired"))?;
        rows.iter().map(row_to_record).collect()
    }

    fn list_superseded(&self, limit: usize) -> Result<Vec<ArtifactRecord>, ArtifactCacheError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM zip_artifacts a \
             WHERE a.status = 'ready' AND EXISTS ( \
                 SELECT 1 FROM zip_artifacts b \
                 WHERE b.folder_key = a.folder_key AND b.status = 'ready' \
                   AND b.created_at > a.created_at) \
             ORDER BY a.created_at ASC LIMIT $1"
        );
        let rows = self
            .rt
            .block_on(
                sqlx::query(&sql)
                    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
                    .fetch_all(self.rt.pool()),
            )
            .map_err(storage("list_superseded"))?;
        rows.iter().map(row_to_record).collect()
    }

    fn remove(&self, folder: &FolderKey, version: &VersionKey) -> Result<bool, ArtifactCacheError> {
        let result = self
            .rt
            .block_on(
                sqlx::query("DELETE FROM zip_artifacts WHERE folder_key = $1 AND version_key = $2")
                    .bind(folder.as_str())
                    .bind(version.as_str())
                    .execute(self.rt.pool()),
            )
            .map_err(storage("remove_artifact"))?;
        Ok(result.rows_affected() == 1)
    }
}
