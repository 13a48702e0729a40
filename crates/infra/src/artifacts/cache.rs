//! Artifact cache registry.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use dirpack_archive::{FolderKey, VersionKey};

use super::types::{
    ArtifactMeta, ArtifactRecord, ArtifactState, ArtifactStatus, ArtifactTier, ClaimOutcome,
    ClaimToken,
};

/// Registry of shared bundles keyed by `(folder_key, version_key)`.
///
/// The row for a key is the mutual-exclusion point for builds: at most one
/// `building` row exists per key, and only the claimant holding its
/// [`ClaimToken`] can move it to `ready` or `failed`.
pub trait ArtifactCache: Send + Sync {
    fn get(&self, folder: &FolderKey, version: &VersionKey) -> Result<Option<ArtifactRecord>, ArtifactCacheError>;

    fn get_state(&self, folder: &FolderKey, version: &VersionKey) -> Result<ArtifactState, ArtifactCacheError> {
        Ok(ArtifactState::of(self.get(folder, version)?.as_ref()))
    }

    /// Take the build for a key.
    ///
    /// Succeeds when no row exists, the row is `failed`, or the row is a
    /// `building` claim last touched before `stale_before`. Otherwise reports
    /// what the current holder has.
    fn claim_building(
        &self,
        folder: &FolderKey,
        version: &VersionKey,
        meta: &ArtifactMeta,
        stale_before: DateTime<Utc>,
    ) -> Result<ClaimOutcome, ArtifactCacheError>;

    /// `building` -> `ready`. Returns `false` if the row is gone, not
    /// `building`, or claimed by someone else.
    fn mark_ready(
        &self,
        folder: &FolderKey,
        version: &VersionKey,
        token: ClaimToken,
        artifact_size_bytes: u64,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, ArtifactCacheError>;

    /// `building` -> `failed`, expiring immediately so the sweep reclaims it.
    fn mark_failed(
        &self,
        folder: &FolderKey,
        version: &VersionKey,
        token: ClaimToken,
        error_summary: &str,
    ) -> Result<bool, ArtifactCacheError>;

    /// Record a cache hit on a `ready` row and refresh its retention.
    fn touch(
        &self,
        folder: &FolderKey,
        version: &VersionKey,
        tier: ArtifactTier,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ArtifactCacheError>;

    /// Accumulated hits across every version of a folder.
    fn popularity(&self, folder: &FolderKey) -> Result<u64, ArtifactCacheError>;

    /// `ready`/`failed` rows whose retention ended before `now`.
    fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ArtifactRecord>, ArtifactCacheError>;

    /// `ready` rows with a newer `ready` version for the same folder.
    fn list_superseded(&self, limit: usize) -> Result<Vec<ArtifactRecord>, ArtifactCacheError>;

    fn remove(&self, folder: &FolderKey, version: &VersionKey) -> Result<bool, ArtifactCacheError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArtifactCacheError {
    #[error("storage error: {0}")]
    Storage(String),
}

type Key = (FolderKey, VersionKey);

/// In-memory cache registry for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryArtifactCache {
    rows: RwLock<HashMap<Key, ArtifactRecord>>,
}

impl InMemoryArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(folder: &FolderKey, version: &VersionKey) -> Key {
        (folder.clone(), version.clone())
    }

    /// Finish a claimed build. `apply` runs only if `token` still owns the row.
    fn finish(
        &self,
        folder: &FolderKey,
        version: &VersionKey,
        token: ClaimToken,
        apply: impl FnOnce(&mut ArtifactRecord),
    ) -> bool {
        let mut rows = self.rows.write().unwrap();
        match rows.get_mut(&Self::key(folder, version)) {
            Some(row) if row.status == ArtifactStatus::Building && row.claim_token == Some(token) => {
                apply(row);
                row.claim_token = None;
                row.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }
}

impl ArtifactCache for InMemoryArtifactCache {
    fn get(&self, folder: &FolderKey, version: &VersionKey) -> Result<Option<ArtifactRecord>, ArtifactCacheError> {
        Ok(self.rows.read().unwrap().get(&Self::key(folder, version)).cloned())
    }

    fn claim_building(
        &self,
        folder: &FolderKey,
        version: &VersionKey,
        meta: &ArtifactMeta,
        stale_before: DateTime<Utc>,
    ) -> Result<ClaimOutcome, ArtifactCacheError> {
        let mut rows = self.rows.write().unwrap();
        let key = Self::key(folder, version);
        if let Some(existing) = rows.get(&key) {
            let reclaimable =
                existing.status == ArtifactStatus::Failed || existing.is_stale_build(stale_before);
            if !reclaimable {
                return Ok(ClaimOutcome::Held(ArtifactState::of(Some(existing))));
            }
        }

        let token = ClaimToken::new();
        let now = Utc::now();
        let hits = rows.get(&key).map_or(0, |r| r.hit_count);
        let mut row = ArtifactRecord::building(folder.clone(), version.clone(), meta, token, now);
        row.hit_count = hits;
        rows.insert(key, row);
        Ok(ClaimOutcome::Claimed(token))
    }

    fn mark_ready(
        &self,
        folder: &FolderKey,
        version: &VersionKey,
        token: ClaimToken,
        artifact_size_bytes: u64,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, ArtifactCacheError> {
        Ok(self.finish(folder, version, token, |row| {
            row.status = ArtifactStatus::Ready;
            row.artifact_size_bytes = Some(artifact_size_bytes);
            row.error_summary = None;
            row.expires_at = Some(expires_at);
        }))
    }

    fn mark_failed(
        &self,
        folder: &FolderKey,
        version: &VersionKey,
        token: ClaimToken,
        error_summary: &str,
    ) -> Result<bool, ArtifactCacheError> {
        Ok(self.finish(folder, version, token, |row| {
            row.status = ArtifactStatus::Failed;
            row.error_summary = Some(error_summary.to_string());
            row.expires_at = Some(Utc::now());
        }))
    }

    fn touch(
        &self,
        folder: &FolderKey,
        version: &VersionKey,
        tier: ArtifactTier,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ArtifactCacheError> {
        let mut rows = self.rows.write().unwrap();
        if let Some(row) = rows.get_mut(&Self::key(folder, version))
            && row.status == ArtifactStatus::Ready
        {
            row.hit_count += 1;
            row.tier = tier;
            row.expires_at = Some(expires_at);
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    fn popularity(&self, folder: &FolderKey) -> Result<u64, ArtifactCacheError> {
        let rows = self.rows.read().unwrap();
        Ok(rows
            .values()
            .filter(|r| &r.folder_key == folder)
            .map(|r| r.hit_count)
            .sum())
    }

    fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ArtifactRecord>, ArtifactCacheError> {
        let rows = self.rows.read().unwrap();
        let mut expired: Vec<_> = rows
            .values()
            .filter(|r| r.status != ArtifactStatus::Building)
            .filter(|r| r.expires_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.expires_at);
        expired.truncate(limit);
        Ok(expired)
    }

    fn list_superseded(&self, limit: usize) -> Result<Vec<ArtifactRecord>, ArtifactCacheError> {
        let rows = self.rows.read().unwrap();
        let mut newest: HashMap<&FolderKey, DateTime<Utc>> = HashMap::new();
        for row in rows.values().filter(|r| r.status == ArtifactStatus::Ready) {
            let entry = newest.entry(&row.folder_key).or_insert(row.created_at);
            if row.created_at > *entry {
                *entry = row.created_at;
            }
        }
        let mut superseded: Vec<_> = rows
            .values()
            .filter(|r| r.status == ArtifactStatus::Ready)
            .filter(|r| newest.get(&r.folder_key).is_some_and(|n| r.created_at < *n))
            .cloned()
            .collect();
        superseded.sort_by_key(|r| r.created_at);
        superseded.truncate(limit);
        Ok(superseded)
    }

    fn remove(&self, folder: &FolderKey, version: &VersionKey) -> Result<bool, ArtifactCacheError> {
        Ok(self.rows.write().unwrap().remove(&Self::key(folder, version)).is_some())
    }
}
