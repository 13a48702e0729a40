//! Background reclamation of per-job bundles whose download handle expired.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::store::{DownloadStore, DownloadStoreError};
use super::types::DownloadHandle;
use crate::workers::{WorkerHandle, spawn_periodic};

const DEFAULT_BATCH: usize = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Bundle files deleted.
    pub removed: usize,
    /// Handles released whose file was already gone.
    pub missing_files: usize,
    /// Files that could not be deleted; their handles keep the reference.
    pub file_errors: usize,
}

/// Deletes the bundle of every expired handle, file first, then the
/// handle's reference to it. The handle row itself stays for job history.
pub struct DownloadCleanupSweep {
    downloads: Arc<dyn DownloadStore>,
    jobs_root: PathBuf,
    batch: usize,
}

impl DownloadCleanupSweep {
    pub fn new(downloads: Arc<dyn DownloadStore>, jobs_root: impl Into<PathBuf>) -> Self {
        Self {
            downloads,
            jobs_root: jobs_root.into(),
            batch: DEFAULT_BATCH,
        }
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn run(&self, now: DateTime<Utc>) -> Result<CleanupReport, DownloadStoreError> {
        let mut report = CleanupReport::default();
        for handle in self.downloads.list_expired(now, self.batch)? {
            self.reclaim(&handle, now, &mut report)?;
        }

        if report != CleanupReport::default() {
            info!(
                removed = report.removed,
                missing_files = report.missing_files,
                file_errors = report.file_errors,
                "download cleanup sweep finished"
            );
        }
        Ok(report)
    }

    fn reclaim(
        &self,
        handle: &DownloadHandle,
        now: DateTime<Utc>,
        report: &mut CleanupReport,
    ) -> Result<(), DownloadStoreError> {
        let Some(bundle_name) = handle.bundle_name.as_deref() else {
            return Ok(());
        };
        if bundle_name.is_empty() || bundle_name.contains(['/', '\\']) || bundle_name == ".." {
            warn!(handle_id = %handle.id, bundle_name, "refusing to delete bundle outside the jobs root");
            report.file_errors += 1;
            return Ok(());
        }

        let path = self.jobs_root.join(bundle_name);
        match std::fs::remove_file(&path) {
            Ok(()) => report.removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => report.missing_files += 1,
            Err(e) => {
                warn!(handle_id = %handle.id, job_id = %handle.job_id, path = %path.display(), error = %e, "failed to delete bundle");
                report.file_errors += 1;
                return Ok(());
            }
        }
        self.downloads.release_bundle(handle.id, now)?;
        Ok(())
    }

    /// Run the sweep on a background thread every `interval`.
    pub fn spawn(self, interval: Duration) -> io::Result<WorkerHandle> {
        spawn_periodic("download-cleanup", interval, move || self.run(Utc::now()).map(|_| ()))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::Duration as ChronoDuration;
    use dirpack_core::{DownloadHandleId, JobId, OwnerId};

    use super::*;
    use crate::downloads::store::InMemoryDownloadStore;

    fn completed(
        store: &InMemoryDownloadStore,
        root: &std::path::Path,
        bundle: &str,
        expires_at: DateTime<Utc>,
        write: bool,
    ) -> DownloadHandleId {
        let handle = DownloadHandle::pending(DownloadHandleId::new(), JobId::new(), OwnerId::new());
        let id = handle.id;
        store.create(handle).unwrap();
        store.complete(id, "http://files.test/x", bundle, expires_at).unwrap();
        if write {
            fs::write(root.join(bundle), b"bundle").unwrap();
        }
        id
    }

    #[test]
    fn expired_bundles_are_deleted_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryDownloadStore::new());
        let now = Utc::now();

        let stale = completed(&store, dir.path(), "old-a-1.tar.gz", now - ChronoDuration::hours(1), true);
        let live = completed(&store, dir.path(), "new-b-2.tar.gz", now + ChronoDuration::hours(1), true);
        let gone = completed(&store, dir.path(), "gone-c-3.tar.gz", now - ChronoDuration::minutes(5), false);

        let sweep = DownloadCleanupSweep::new(store.clone(), dir.path());
        let report = sweep.run(now).unwrap();
        assert_eq!(
            report,
            CleanupReport {
                removed: 1,
                missing_files: 1,
                file_errors: 0
            }
        );
        assert!(!dir.path().join("old-a-1.tar.gz").exists());
        assert!(dir.path().join("new-b-2.tar.gz").exists());
        assert_eq!(store.get(stale).unwrap().unwrap().bundle_name, None);
        assert_eq!(store.get(gone).unwrap().unwrap().bundle_name, None);
        assert!(store.get(live).unwrap().unwrap().bundle_name.is_some());

        // Nothing left to do on a second pass.
        assert_eq!(sweep.run(now).unwrap(), CleanupReport::default());
    }

    #[test]
    fn cancelled_handle_frees_its_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryDownloadStore::new());
        let now = Utc::now();
        let id = completed(&store, dir.path(), "tape-d-4.tar.gz", now + ChronoDuration::days(1), true);
        store.expire_now(id, now).unwrap();

        let report = DownloadCleanupSweep::new(store.clone(), dir.path()).run(now).unwrap();
        assert_eq!(report.removed, 1);
        assert!(!dir.path().join("tape-d-4.tar.gz").exists());
    }

    #[test]
    fn names_with_separators_are_never_followed() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("keep.tar.gz");
        fs::write(&outside, b"x").unwrap();
        let jobs_root = dir.path().join("jobs");
        fs::create_dir_all(&jobs_root).unwrap();

        let store = Arc::new(InMemoryDownloadStore::new());
        let now = Utc::now();
        completed(&store, &jobs_root, "../keep.tar.gz", now - ChronoDuration::hours(1), false);

        let report = DownloadCleanupSweep::new(store, &jobs_root).run(now).unwrap();
        assert_eq!(report.file_errors, 1);
        assert!(outside.exists());
    }
}
