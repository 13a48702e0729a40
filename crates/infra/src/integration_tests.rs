//! Full pipeline scenarios on in-memory adapters.
//!
//! Submission -> queue -> orchestrator -> builder/cache -> lifecycle ->
//! quota, download handle, realtime events.

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex, OnceLock, mpsc};
    use std::time::{Duration, Instant};

    use chrono::Utc;

    use dirpack_core::{JobId, OwnerId};
    use dirpack_events::JobEvent;
    use dirpack_quota::{OwnerKey, QuotaPolicy};

    use crate::artifacts::{ArtifactCache, ArtifactState, ArtifactStorage, InMemoryArtifactCache};
    use crate::config::{PipelineConfig, PoolSpec};
    use crate::downloads::{DownloadStore, InMemoryDownloadStore};
    use crate::event_bus::{Notifier, RecordingNotifier};
    use crate::jobs::{InMemoryJobStore, JobRecordStore, JobStatus};
    use crate::ledger::{InMemoryQuotaLedger, QuotaLedger};
    use crate::lifecycle::JobLifecycle;
    use crate::orchestrator::{JobOrchestrator, OrchestratorSettings, ProcessOutcome, SkipReason};
    use crate::queue::{InMemoryJobQueue, JobQueue};
    use crate::submission::{JobRef, SubmissionService, SubmissionSettings, SubmitRequest};
    use crate::supervisor::WorkerSupervisor;

    const SHORT_LEASE: Duration = Duration::from_millis(200);

    /// Records events and reacts to progress.
    ///
    /// Once armed it cancels the job on its first progress event the way a
    /// second API process would (status transition only). A watcher hears
    /// about every progress event, and a non-zero `pace` slows the build down.
    #[derive(Default)]
    struct ScriptedNotifier {
        recorder: RecordingNotifier,
        service: OnceLock<Arc<SubmissionService>>,
        armed: Mutex<bool>,
        watcher: Mutex<Option<mpsc::Sender<JobId>>>,
        pace: Mutex<Duration>,
    }

    impl Notifier for ScriptedNotifier {
        fn notify(&self, owner: OwnerId, event: JobEvent) {
            let progress = matches!(event, JobEvent::Progress { .. });
            let trigger = progress && std::mem::take(&mut *self.armed.lock().unwrap());
            let job_id = event.job_id();
            self.recorder.notify(owner, event);
            if trigger && let Some(service) = self.service.get() {
                service.cancel(JobRef::Record(job_id), owner).unwrap();
            }
            if progress {
                if let Some(watcher) = self.watcher.lock().unwrap().as_ref() {
                    let _ = watcher.send(job_id);
                }
                std::thread::sleep(*self.pace.lock().unwrap());
            }
        }
    }

    struct Pipeline {
        dir: tempfile::TempDir,
        jobs: Arc<InMemoryJobStore>,
        quota: Arc<InMemoryQuotaLedger>,
        downloads: Arc<InMemoryDownloadStore>,
        artifacts: Arc<InMemoryArtifactCache>,
        queue: Arc<InMemoryJobQueue>,
        notifier: Arc<ScriptedNotifier>,
        orchestrator: Arc<JobOrchestrator>,
        service: Arc<SubmissionService>,
        /// Same service, but it also signals builds running in `supervisor`.
        local_service: Arc<SubmissionService>,
        supervisor: Arc<WorkerSupervisor>,
    }

    impl Pipeline {
        fn new() -> Self {
            Self::with_lease(Duration::from_secs(300))
        }

        fn with_lease(lease: Duration) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let jobs = Arc::new(InMemoryJobStore::new());
            let quota = Arc::new(InMemoryQuotaLedger::new());
            let downloads = Arc::new(InMemoryDownloadStore::new());
            let artifacts = Arc::new(InMemoryArtifactCache::new());
            let queue = Arc::new(InMemoryJobQueue::new("compression", lease));
            let notifier = Arc::new(ScriptedNotifier::default());

            let config = PipelineConfig {
                compressed_dirs_root: dir.path().join("compressed"),
                backend_url: "https://files.example".into(),
                progress_step: 10,
                max_active_per_owner: 10,
                quota_policy: QuotaPolicy::Soft,
                ..PipelineConfig::default()
            };

            let lifecycle = Arc::new(JobLifecycle::new(
                jobs.clone(),
                quota.clone(),
                downloads.clone(),
                notifier.clone(),
                config.backend_url.clone(),
                config.download_ttl,
            ));
            let orchestrator = Arc::new(JobOrchestrator::new(
                lifecycle.clone(),
                artifacts.clone(),
                ArtifactStorage::new(config.shared_artifacts_root()),
                OrchestratorSettings::from_config(&config),
            ));
            let supervisor = Arc::new(
                WorkerSupervisor::new(orchestrator.clone(), Duration::from_millis(20)).with_queue(queue.clone()),
            );
            let service = Arc::new(SubmissionService::new(
                lifecycle.clone(),
                quota.clone(),
                downloads.clone(),
                queue.clone(),
                SubmissionSettings::from_config(&config),
            ));
            let local_service = Arc::new(
                SubmissionService::new(
                    lifecycle,
                    quota.clone(),
                    downloads.clone(),
                    queue.clone(),
                    SubmissionSettings::from_config(&config),
                )
                .with_supervisor(supervisor.clone()),
            );
            quota.open_account(&account(), 10_000_000_000).unwrap();

            Self {
                dir,
                jobs,
                quota,
                downloads,
                artifacts,
                queue,
                notifier,
                orchestrator,
                service,
                local_service,
                supervisor,
            }
        }

        fn folder(&self, name: &str, files: usize, file_bytes: usize) -> PathBuf {
            let root = self.dir.path().join("library").join(name);
            fs::create_dir_all(root.join("disc2")).unwrap();
            for i in 0..files {
                let sub = if i % 2 == 0 { root.clone() } else { root.join("disc2") };
                let body: Vec<u8> = (0..file_bytes).map(|b| ((b * 31 + i * 7) % 251) as u8).collect();
                fs::write(sub.join(format!("track-{i:02}.wav")), body).unwrap();
            }
            root
        }

        fn submit(&self, owner: OwnerId, folder: &Path, estimate: u64) -> JobId {
            self.service
                .submit(SubmitRequest {
                    owner_id: owner,
                    quota_account_key: account(),
                    source_relative_path: format!("/library/{}", folder.file_name().unwrap().to_string_lossy()),
                    source_absolute_path: folder.display().to_string(),
                    estimated_size_bytes: estimate,
                    version_key: None,
                })
                .unwrap()
                .job_id
        }

        /// Lease and run the next message the way a pool thread does.
        fn run_next(&self) -> ProcessOutcome {
            let delivery = self
                .queue
                .reserve("test-worker", Duration::from_secs(1))
                .unwrap()
                .expect("a queued message");
            let outcome = self.orchestrator.process_delivery(&delivery).unwrap();
            self.queue.ack(&delivery).unwrap();
            outcome
        }

        fn used(&self) -> u64 {
            self.quota.snapshot(&account()).unwrap().unwrap().bytes_used
        }

        fn status(&self, job_id: JobId) -> JobStatus {
            self.jobs.get(job_id).unwrap().unwrap().status
        }

        fn events(&self, job_id: JobId) -> Vec<JobEvent> {
            self.notifier.recorder.for_job(job_id)
        }

        fn wait_terminal(&self, job_id: JobId) -> JobStatus {
            let deadline = Instant::now() + Duration::from_secs(30);
            loop {
                let status = self.status(job_id);
                if status.is_terminal() {
                    return status;
                }
                assert!(Instant::now() < deadline, "job {job_id} stuck in {status}");
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }

    fn account() -> OwnerKey {
        OwnerKey::new("acct:extended").unwrap()
    }

    /// Progress strictly increasing, exactly one terminal event, and it is last.
    fn assert_well_ordered(events: &[JobEvent]) {
        let terminal: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminal.len(), 1, "events: {events:?}");
        assert!(events.last().unwrap().is_terminal(), "events: {events:?}");
        let progress: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Progress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect();
        assert!(progress.windows(2).all(|w| w[0] < w[1]), "progress: {progress:?}");
        assert!(progress.iter().all(|p| *p <= 100));
    }

    #[test]
    fn completed_job_keeps_its_debit_and_publishes_a_link() {
        let p = Pipeline::new();
        let folder = p.folder("album", 6, 32 * 1024);
        let owner = OwnerId::new();
        let job_id = p.submit(owner, &folder, 196_608);
        assert_eq!(p.used(), 196_608);

        assert_eq!(p.run_next(), ProcessOutcome::Completed { cache_hit: false });
        assert_eq!(p.status(job_id), JobStatus::Completed);
        assert_eq!(p.used(), 196_608);

        let events = p.events(job_id);
        assert!(matches!(events.first(), Some(JobEvent::Queued { .. })));
        assert_well_ordered(&events);
        let Some(JobEvent::Completed { download_url, .. }) = events.last() else {
            panic!("expected completion, got {events:?}");
        };
        assert!(download_url.starts_with("https://files.example/download-dir?name=album-"));
        assert!(download_url.ends_with(&format!("&jobId={job_id}")));

        let view = p.service.job(job_id, owner).unwrap();
        assert_eq!(view.download_url.as_deref(), Some(download_url.as_str()));
    }

    #[test]
    fn failed_two_gigabyte_job_restores_quota_exactly() {
        let p = Pipeline::new();
        p.quota.debit(&account(), 500).unwrap();

        let missing = p.dir.path().join("library").join("vanished");
        let job_id = p.submit(OwnerId::new(), &missing, 2_000_000_000);
        assert_eq!(p.used(), 2_000_000_500);

        assert_eq!(p.run_next(), ProcessOutcome::Failed);
        assert_eq!(p.status(job_id), JobStatus::Failed);
        assert_eq!(p.used(), 500);
        assert_eq!(p.events(job_id).last(), Some(&JobEvent::Failed { job_id }));
    }

    #[test]
    fn compensation_floors_at_zero_after_concurrent_credits() {
        let p = Pipeline::new();
        let missing = p.dir.path().join("library").join("vanished");
        let job_id = p.submit(OwnerId::new(), &missing, 2_000_000_000);

        // Another job's compensation lands first and over-credits.
        p.quota.credit(&account(), 1_500_000_000).unwrap();
        assert_eq!(p.run_next(), ProcessOutcome::Failed);
        assert_eq!(p.status(job_id), JobStatus::Failed);
        assert_eq!(p.used(), 0);
    }

    #[test]
    fn redelivery_after_terminal_state_is_a_no_op() {
        let p = Pipeline::new();
        let missing = p.dir.path().join("library").join("vanished");
        let job_id = p.submit(OwnerId::new(), &missing, 1_000);

        let delivery = p.queue.reserve("w1", Duration::ZERO).unwrap().unwrap();
        assert_eq!(p.orchestrator.process_delivery(&delivery).unwrap(), ProcessOutcome::Failed);
        let events_before = p.events(job_id);

        assert_eq!(
            p.orchestrator.process_delivery(&delivery).unwrap(),
            ProcessOutcome::Skipped(SkipReason::AlreadyTerminal)
        );
        assert_eq!(p.used(), 0);
        assert_eq!(p.events(job_id), events_before);
    }

    #[test]
    fn expired_lease_redelivers_and_the_job_resumes() {
        let p = Pipeline::with_lease(SHORT_LEASE);
        let folder = p.folder("live-set", 4, 16 * 1024);
        let job_id = p.submit(OwnerId::new(), &folder, 65_536);

        // A worker takes the job, marks it running and dies.
        let abandoned = p.queue.reserve("dying-worker", Duration::ZERO).unwrap().unwrap();
        p.orchestrator.lifecycle().begin(abandoned.message.job_record_id).unwrap();
        assert_eq!(p.status(job_id), JobStatus::InProgress);

        let redelivered = p.queue.reserve("w2", SHORT_LEASE * 5).unwrap().unwrap();
        assert_eq!(redelivered.attempt, 2);
        assert_eq!(
            p.orchestrator.process_delivery(&redelivered).unwrap(),
            ProcessOutcome::Completed { cache_hit: false }
        );
        p.queue.ack(&redelivered).unwrap();
        assert_eq!(p.used(), 65_536);
        assert_well_ordered(&p.events(job_id));
    }

    #[test]
    fn second_owner_is_served_from_the_first_owners_artifact() {
        let p = Pipeline::new();
        let folder = p.folder("box-set", 4, 16 * 1024);
        let first = p.submit(OwnerId::new(), &folder, 65_536);
        let second = p.submit(OwnerId::new(), &folder, 65_536);

        assert_eq!(p.run_next(), ProcessOutcome::Completed { cache_hit: false });
        assert_eq!(p.run_next(), ProcessOutcome::Completed { cache_hit: true });

        let first = p.jobs.get(first).unwrap().unwrap();
        let second = p.jobs.get(second).unwrap().unwrap();
        assert!(first.version_key.is_some());
        assert_eq!(first.version_key, second.version_key);

        let folder_key = dirpack_archive::FolderKey::normalize("/library/box-set");
        let version = dirpack_archive::VersionKey::explicit(first.version_key.as_deref().unwrap()).unwrap();
        let record = p.artifacts.get(&folder_key, &version).unwrap().unwrap();
        assert_eq!(record.hit_count, 1);
        assert!(matches!(
            p.artifacts.get_state(&folder_key, &version).unwrap(),
            ArtifactState::Ready { .. }
        ));
        // Each owner has a distinct file of their own.
        let a = p.downloads.get(first.download_handle_id).unwrap().unwrap().bundle_name;
        let b = p.downloads.get(second.download_handle_id).unwrap().unwrap().bundle_name;
        assert_ne!(a, b);
    }

    #[test]
    fn cancellation_from_another_process_stops_the_build_and_compensates_once() {
        let p = Pipeline::new();
        assert!(p.notifier.service.set(p.service.clone()).is_ok());
        *p.notifier.armed.lock().unwrap() = true;

        let folder = p.folder("field-recordings", 24, 256 * 1024);
        let owner = OwnerId::new();
        let estimate = 24 * 256 * 1024;
        let job_id = p.submit(owner, &folder, estimate);

        assert_eq!(p.run_next(), ProcessOutcome::Cancelled);
        assert_eq!(p.status(job_id), JobStatus::Cancelled);
        assert_eq!(p.used(), 0);

        let events = p.events(job_id);
        assert_well_ordered(&events);
        assert_eq!(events.last(), Some(&JobEvent::Cancelled { job_id }));

        let handle_id = p.jobs.get(job_id).unwrap().unwrap().download_handle_id;
        let handle = p.downloads.get(handle_id).unwrap().unwrap();
        assert!(handle.is_expired(Utc::now()));
        assert!(handle.usable_url(Utc::now()).is_none());
    }

    #[test]
    fn cancelling_a_build_running_in_this_process_stops_it_and_compensates_once() {
        let p = Pipeline::new();
        let (tx, rx) = mpsc::channel();
        *p.notifier.watcher.lock().unwrap() = Some(tx);
        *p.notifier.pace.lock().unwrap() = Duration::from_millis(40);
        p.supervisor
            .start_pool(&PoolSpec {
                name: "compression".into(),
                queue: "compression".into(),
                concurrency: 1,
            })
            .unwrap();

        // Unrelated usage that a double refund would eat into.
        p.quota.debit(&account(), 500).unwrap();
        let folder = p.folder("rehearsals", 24, 256 * 1024);
        let owner = OwnerId::new();
        let job_id = p.submit(owner, &folder, 24 * 256 * 1024);

        let first = rx.recv_timeout(Duration::from_secs(30)).unwrap();
        assert_eq!(first, job_id);
        let cancelled = p.local_service.cancel(JobRef::Record(job_id), owner).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        assert_eq!(p.wait_terminal(job_id), JobStatus::Cancelled);
        let deadline = Instant::now() + Duration::from_secs(10);
        while p.supervisor.stats()["compression"].processed < 1 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }
        let stats = p.supervisor.stats()["compression"].clone();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.completed, 0);
        assert_eq!(p.used(), 500);

        let events = p.events(job_id);
        assert_well_ordered(&events);
        assert_eq!(events.last(), Some(&JobEvent::Cancelled { job_id }));

        let handle_id = p.jobs.get(job_id).unwrap().unwrap().download_handle_id;
        let handle = p.downloads.get(handle_id).unwrap().unwrap();
        assert!(handle.is_expired(Utc::now()));
        assert!(handle.usable_url(Utc::now()).is_none());
        p.supervisor.shutdown();
    }

    #[test]
    fn worker_pools_drive_concurrent_jobs_to_one_terminal_state_each() {
        let p = Pipeline::new();
        p.supervisor
            .start_pool(&PoolSpec {
                name: "compression".into(),
                queue: "compression".into(),
                concurrency: 3,
            })
            .unwrap();

        let shared = p.folder("shared", 6, 64 * 1024);
        let missing = p.dir.path().join("library").join("gone");
        let mut jobs = Vec::new();
        for _ in 0..3 {
            jobs.push((p.submit(OwnerId::new(), &shared, 1_000), JobStatus::Completed));
        }
        jobs.push((p.submit(OwnerId::new(), &missing, 1_000), JobStatus::Failed));

        for (job_id, expected) in &jobs {
            assert_eq!(p.wait_terminal(*job_id), *expected);
            assert_well_ordered(&p.events(*job_id));
        }
        // Only the failed job was compensated.
        assert_eq!(p.used(), 3_000);

        let versions: Vec<_> = jobs[..3]
            .iter()
            .map(|(id, _)| p.jobs.get(*id).unwrap().unwrap().version_key)
            .collect();
        assert!(versions.windows(2).all(|w| w[0] == w[1]));

        let deadline = Instant::now() + Duration::from_secs(5);
        while p.supervisor.stats()["compression"].processed < 4 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }
        let stats = p.supervisor.stats()["compression"].clone();
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_flight, 0);

        p.supervisor.shutdown();
        assert_eq!(p.queue.depth().unwrap(), 0);
    }
}
