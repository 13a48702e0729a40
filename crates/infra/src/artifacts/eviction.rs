//! Background reclamation of cached bundles.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::cache::{ArtifactCache, ArtifactCacheError};
use super::storage::ArtifactStorage;
use super::types::ArtifactRecord;
use crate::workers::{WorkerHandle, spawn_periodic};

const DEFAULT_BATCH: usize = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub expired: usize,
    pub superseded: usize,
    /// Rows removed whose file was already gone.
    pub missing_files: usize,
    /// Files that could not be deleted; their rows are kept for the next run.
    pub file_errors: usize,
}

/// Deletes expired and superseded artifacts, file first, then row.
///
/// Never touches `building` rows, so it cannot interfere with a running job.
pub struct EvictionSweep {
    cache: Arc<dyn ArtifactCache>,
    storage: ArtifactStorage,
    batch: usize,
}

impl EvictionSweep {
    pub fn new(cache: Arc<dyn ArtifactCache>, storage: ArtifactStorage) -> Self {
        Self {
            cache,
            storage,
            batch: DEFAULT_BATCH,
        }
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn run(&self, now: DateTime<Utc>) -> Result<EvictionReport, ArtifactCacheError> {
        let mut report = EvictionReport::default();

        for record in self.cache.list_expired(now, self.batch)? {
            if self.evict(&record, &mut report)? {
                report.expired += 1;
            }
        }
        for record in self.cache.list_superseded(self.batch)? {
            if self.evict(&record, &mut report)? {
                report.superseded += 1;
            }
        }

        if report != EvictionReport::default() {
            info!(
                expired = report.expired,
                superseded = report.superseded,
                missing_files = report.missing_files,
                file_errors = report.file_errors,
                "artifact eviction sweep finished"
            );
        }
        Ok(report)
    }

    fn evict(&self, record: &ArtifactRecord, report: &mut EvictionReport) -> Result<bool, ArtifactCacheError> {
        match self.storage.remove(&record.artifact_name) {
            Ok(true) => {}
            Ok(false) => report.missing_files += 1,
            Err(e) => {
                warn!(
                    folder_key = %record.folder_key,
                    version_key = %record.version_key,
                    error = %e,
                    "failed to delete artifact file"
                );
                report.file_errors += 1;
                return Ok(false);
            }
        }
        self.cache.remove(&record.folder_key, &record.version_key)
    }

    /// Run the sweep on a background thread every `interval`.
    pub fn spawn(self, interval: Duration) -> io::Result<WorkerHandle> {
        spawn_periodic("artifact-eviction", interval, move || self.run(Utc::now()).map(|_| ()))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::Duration as ChronoDuration;
    use dirpack_archive::{FolderKey, VersionKey};

    use super::*;
    use crate::artifacts::cache::InMemoryArtifactCache;
    use crate::artifacts::types::{ArtifactMeta, ArtifactState, ArtifactTier, ClaimOutcome};

    fn ready(
        cache: &InMemoryArtifactCache,
        storage: &ArtifactStorage,
        version: &str,
        expires_at: DateTime<Utc>,
    ) -> String {
        let folder = FolderKey::normalize("/music/album");
        let version = VersionKey::explicit(version).unwrap();
        let name = format!("album-{version}.tar.gz");
        fs::create_dir_all(storage.root()).unwrap();
        fs::write(storage.root().join(&name), b"x").unwrap();
        let meta = ArtifactMeta {
            artifact_name: name.clone(),
            source_size_bytes: 1,
            tier: ArtifactTier::Warm,
        };
        let ClaimOutcome::Claimed(token) = cache
            .claim_building(&folder, &version, &meta, Utc::now() - ChronoDuration::hours(1))
            .unwrap()
        else {
            panic!("claim failed");
        };
        cache.mark_ready(&folder, &version, token, 1, expires_at).unwrap();
        name
    }

    #[test]
    fn sweep_removes_expired_and_superseded_bundles() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ArtifactStorage::new(dir.path());
        let cache = Arc::new(InMemoryArtifactCache::new());
        let future = Utc::now() + ChronoDuration::days(1);

        let old = ready(&cache, &storage, "v1", future);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let current = ready(&cache, &storage, "v2", future);

        let sweep = EvictionSweep::new(cache.clone(), storage.clone());
        let report = sweep.run(Utc::now()).unwrap();
        assert_eq!(report.superseded, 1);
        assert_eq!(report.expired, 0);
        assert!(!storage.exists(&old));
        assert!(storage.exists(&current));

        // Past the retention window the current bundle goes too.
        let report = sweep.run(future + ChronoDuration::seconds(1)).unwrap();
        assert_eq!(report.expired, 1);
        assert!(!storage.exists(&current));
        let folder = FolderKey::normalize("/music/album");
        assert_eq!(
            cache.get_state(&folder, &VersionKey::explicit("v2").unwrap()).unwrap(),
            ArtifactState::Absent
        );
    }

    #[test]
    fn missing_files_still_drop_the_row() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ArtifactStorage::new(dir.path());
        let cache = Arc::new(InMemoryArtifactCache::new());
        let name = ready(&cache, &storage, "v1", Utc::now() - ChronoDuration::seconds(1));
        fs::remove_file(storage.root().join(&name)).unwrap();

        let report = EvictionSweep::new(cache.clone(), storage).run(Utc::now()).unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.missing_files, 1);
    }
}
