//! Job Orchestrator: runs one delivered job to a terminal state.
//!
//! Per delivery:
//!
//! 1. `queued` -> `in_progress` (a redelivery of a running job resumes it,
//!    a redelivery of a finished job is dropped)
//! 2. measure the folder, resolve its `(FolderKey, VersionKey)`
//! 3. consult the artifact cache: reuse a `ready` bundle, or claim the build,
//!    or build a private copy when someone else holds the claim
//! 4. build, republishing throttled progress
//! 5. hand the terminal outcome to [`JobLifecycle`]
//!
//! The build runs under `catch_unwind`, so even a panic reaches step 5.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use dirpack_archive::{
    ArchiveBuilder, BuildError, BuildProgress, BuildRequest, CancelFlag, CompressionLevel, FolderKey,
    ProgressThrottle, VersionKey, job_bundle_name, measure_folder, shared_bundle_name,
};
use dirpack_core::JobId;
use dirpack_events::JobEvent;

use crate::artifacts::{
    ArtifactCache, ArtifactMeta, ArtifactState, ArtifactStorage, ClaimOutcome, ClaimToken, TierPolicy,
};
use crate::config::{CacheMode, PipelineConfig};
use crate::jobs::{JobRecord, JobStatus};
use crate::lifecycle::{BeginOutcome, JobLifecycle, LifecycleError};
use crate::queue::Delivery;

/// Knobs the orchestrator reads from [`PipelineConfig`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Per-job bundles are written here.
    pub jobs_root: PathBuf,
    pub compression_level: CompressionLevel,
    pub progress_step: u8,
    pub cache_mode: CacheMode,
    pub cache_wait: Duration,
    pub cache_poll: Duration,
    pub build_stale_after: chrono::Duration,
    pub tiers: TierPolicy,
}

impl OrchestratorSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            jobs_root: config.compressed_dirs_root.clone(),
            compression_level: config.compression_level,
            progress_step: config.progress_step,
            cache_mode: config.cache_mode,
            cache_wait: config.cache_wait,
            cache_poll: Duration::from_millis(500),
            build_stale_after: config.build_stale_after,
            tiers: TierPolicy {
                hot_min_hits: config.artifact_hot_min_hits,
                hot_ttl: config.artifact_hot_ttl,
                warm_ttl: config.artifact_warm_ttl,
            },
        }
    }
}

/// How a delivery ended, from the worker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed { cache_hit: bool },
    Failed,
    Cancelled,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No job record for the message.
    Missing,
    /// Redelivery of a job that already finished.
    AlreadyTerminal,
    /// Someone else moved the job to a terminal state while it ran.
    LostRace,
}

/// Bookkeeping for a job running in this process.
#[derive(Debug, Clone)]
struct ActiveJob {
    cancel: CancelFlag,
    /// Progress events are published while holding this lock; the terminal
    /// event seals it first, so nothing can follow the terminal event.
    throttle: Arc<Mutex<ProgressThrottle>>,
}

#[derive(Debug)]
struct Built {
    bundle_name: String,
    cache_hit: bool,
}

#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("worker panicked: {0}")]
    Panicked(String),
}

/// A cache claim held by this job for the duration of its build.
struct HeldClaim {
    token: ClaimToken,
    shared_name: String,
}

pub struct JobOrchestrator {
    lifecycle: Arc<JobLifecycle>,
    artifacts: Arc<dyn ArtifactCache>,
    storage: ArtifactStorage,
    builder: ArchiveBuilder,
    settings: OrchestratorSettings,
    active: Mutex<HashMap<JobId, ActiveJob>>,
}

impl JobOrchestrator {
    pub fn new(
        lifecycle: Arc<JobLifecycle>,
        artifacts: Arc<dyn ArtifactCache>,
        storage: ArtifactStorage,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            lifecycle,
            artifacts,
            storage,
            builder: ArchiveBuilder::new(settings.compression_level),
            settings,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn lifecycle(&self) -> &Arc<JobLifecycle> {
        &self.lifecycle
    }

    /// Signal a job running in this process to stop.
    ///
    /// Seals its progress stream so the caller's terminal event is the last
    /// one. Returns `false` when the job isn't running here.
    pub fn cancel(&self, job_id: JobId) -> bool {
        let Some(active) = self.active.lock().unwrap().get(&job_id).cloned() else {
            return false;
        };
        let first = active.cancel.cancel();
        active.throttle.lock().unwrap().seal();
        if first {
            info!(job_id = %job_id, "cancellation signalled to running build");
        }
        true
    }

    pub fn running_jobs(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    /// Run one delivery to a terminal state.
    ///
    /// `Err` means a store was unreachable; the message should stay
    /// unacknowledged so the queue redelivers it.
    pub fn process_delivery(&self, delivery: &Delivery) -> Result<ProcessOutcome, LifecycleError> {
        let job = match self.lifecycle.begin(delivery.message.job_record_id)? {
            BeginOutcome::Started(job) | BeginOutcome::Resumed(job) => job,
            BeginOutcome::AlreadyTerminal(_) => return Ok(ProcessOutcome::Skipped(SkipReason::AlreadyTerminal)),
            BeginOutcome::Missing => {
                error!(
                    queue_job_id = %delivery.queue_job_id,
                    job_id = %delivery.message.job_record_id,
                    "no job record for delivered message"
                );
                return Ok(ProcessOutcome::Skipped(SkipReason::Missing));
            }
        };

        let active = self.register(job.id);
        let run = panic::catch_unwind(AssertUnwindSafe(|| self.run(&job, delivery, &active)))
            .unwrap_or_else(|payload| Err(RunError::Panicked(panic_message(payload.as_ref()))));
        let outcome = self.finish(&job, &active, run);
        self.active.lock().unwrap().remove(&job.id);
        outcome
    }

    fn register(&self, job_id: JobId) -> ActiveJob {
        let active = ActiveJob {
            cancel: CancelFlag::new(),
            throttle: Arc::new(Mutex::new(ProgressThrottle::new(self.settings.progress_step))),
        };
        self.active.lock().unwrap().insert(job_id, active.clone());
        active
    }

    fn run(&self, job: &JobRecord, delivery: &Delivery, active: &ActiveJob) -> Result<Built, RunError> {
        let message = &delivery.message;
        let source = PathBuf::from(&message.source_folder_absolute_path);
        let stats = measure_folder(&source).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => BuildError::SourceMissing(source.clone()),
            _ => BuildError::from_io(&source, e),
        })?;

        let folder = FolderKey::normalize(&message.source_folder_relative_path);
        let version = VersionKey::resolve(
            message.version_key.as_deref(),
            &folder,
            stats.total_bytes,
            stats.modified_at_millis,
        );
        if let Err(e) = self.lifecycle.jobs().record_version_key(job.id, version.as_str()) {
            warn!(job_id = %job.id, error = %e, "could not record version key");
        }

        let bundle_name = job_bundle_name(&folder, job.owner_id, &job.queue_job_id);
        let destination = self.settings.jobs_root.join(&bundle_name);
        fs::create_dir_all(&self.settings.jobs_root).map_err(|e| BuildError::from_io(&self.settings.jobs_root, e))?;

        let shared_name = shared_bundle_name(&folder, &version);
        let claim = match self.consult_cache(job, &folder, &version, &shared_name, stats.total_bytes, active) {
            CacheDecision::Reuse(artifact_name) => {
                if self.reuse(job, &folder, &version, &artifact_name, &destination) {
                    return Ok(Built {
                        bundle_name,
                        cache_hit: true,
                    });
                }
                None
            }
            CacheDecision::Build(claim) => claim,
        };

        let built = self.builder.build(
            &BuildRequest {
                source: &source,
                destination: &destination,
                total_bytes: stats.total_bytes,
            },
            &active.cancel,
            |progress| self.on_progress(job, active, progress),
        );

        match (built, claim) {
            (Ok(outcome), Some(claim)) => {
                self.publish_shared(&folder, &version, &claim, &destination, outcome.artifact_bytes);
            }
            (Err(e), Some(claim)) => {
                self.release_failed(&folder, &version, claim.token, &e.to_string());
                return Err(e.into());
            }
            (Err(e), None) => return Err(e.into()),
            (Ok(_), None) => {}
        }

        Ok(Built {
            bundle_name,
            cache_hit: false,
        })
    }

    fn consult_cache(
        &self,
        job: &JobRecord,
        folder: &FolderKey,
        version: &VersionKey,
        shared_name: &str,
        source_size_bytes: u64,
        active: &ActiveJob,
    ) -> CacheDecision {
        let state = match self.artifacts.get_state(folder, version) {
            Ok(state) => state,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "artifact cache unavailable; building privately");
                return CacheDecision::Build(None);
            }
        };

        let state = match state {
            ArtifactState::Building if self.settings.cache_mode == CacheMode::Strict => {
                self.wait_for_foreign_build(job, folder, version, active)
            }
            other => other,
        };

        match state {
            ArtifactState::Ready { artifact_name, .. } => CacheDecision::Reuse(artifact_name),
            // A live foreign claim is refused by the store; a stale one is taken over.
            ArtifactState::Building | ArtifactState::Absent | ArtifactState::Failed => {
                self.try_claim(job, folder, version, shared_name, source_size_bytes)
            }
        }
    }

    fn try_claim(
        &self,
        job: &JobRecord,
        folder: &FolderKey,
        version: &VersionKey,
        shared_name: &str,
        source_size_bytes: u64,
    ) -> CacheDecision {
        let tier = self
            .artifacts
            .popularity(folder)
            .map(|hits| self.settings.tiers.resolve(hits))
            .unwrap_or_default();
        let meta = ArtifactMeta {
            artifact_name: shared_name.to_string(),
            source_size_bytes,
            tier,
        };
        let stale_before = Utc::now() - self.settings.build_stale_after;
        match self.artifacts.claim_building(folder, version, &meta, stale_before) {
            Ok(ClaimOutcome::Claimed(token)) => {
                debug!(job_id = %job.id, folder_key = %folder, version_key = %version, "artifact build claimed");
                CacheDecision::Build(Some(HeldClaim {
                    token,
                    shared_name: shared_name.to_string(),
                }))
            }
            Ok(ClaimOutcome::Held(ArtifactState::Ready { artifact_name, .. })) => CacheDecision::Reuse(artifact_name),
            Ok(ClaimOutcome::Held(_)) => {
                debug!(job_id = %job.id, folder_key = %folder, "fingerprint being built elsewhere; building private copy");
                CacheDecision::Build(None)
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "artifact claim failed; building privately");
                CacheDecision::Build(None)
            }
        }
    }

    /// Strict mode: poll a foreign build until it settles or the wait runs out.
    fn wait_for_foreign_build(
        &self,
        job: &JobRecord,
        folder: &FolderKey,
        version: &VersionKey,
        active: &ActiveJob,
    ) -> ArtifactState {
        let deadline = Instant::now() + self.settings.cache_wait;
        loop {
            if active.cancel.is_cancelled() || Instant::now() >= deadline {
                info!(job_id = %job.id, folder_key = %folder, "stopped waiting for foreign build");
                return ArtifactState::Building;
            }
            thread::sleep(self.settings.cache_poll.min(self.settings.cache_wait));
            match self.artifacts.get_state(folder, version) {
                Ok(ArtifactState::Building) => continue,
                Ok(settled) => return settled,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "artifact cache unavailable while waiting");
                    return ArtifactState::Building;
                }
            }
        }
    }

    /// Hand the job its own copy of a shared bundle. `false` means fall back
    /// to building.
    fn reuse(
        &self,
        job: &JobRecord,
        folder: &FolderKey,
        version: &VersionKey,
        artifact_name: &str,
        destination: &std::path::Path,
    ) -> bool {
        if let Err(e) = self.storage.materialize(artifact_name, destination) {
            warn!(job_id = %job.id, artifact = %artifact_name, error = %e, "cached artifact unusable; rebuilding");
            return false;
        }

        let hits = self.artifacts.popularity(folder).unwrap_or(0).saturating_add(1);
        let tier = self.settings.tiers.resolve(hits);
        let expires_at = self.settings.tiers.expires_at(tier, Utc::now());
        if let Err(e) = self.artifacts.touch(folder, version, tier, expires_at) {
            warn!(job_id = %job.id, error = %e, "failed to record cache hit");
        }
        info!(job_id = %job.id, folder_key = %folder, version_key = %version, tier = tier.as_str(), "served from artifact cache");
        true
    }

    fn publish_shared(
        &self,
        folder: &FolderKey,
        version: &VersionKey,
        claim: &HeldClaim,
        built: &std::path::Path,
        artifact_bytes: u64,
    ) {
        if let Err(e) = self.storage.publish(built, &claim.shared_name) {
            warn!(folder_key = %folder, error = %e, "failed to publish shared artifact");
            self.release_failed(folder, version, claim.token, &e.to_string());
            return;
        }
        let tier = self
            .artifacts
            .popularity(folder)
            .map(|hits| self.settings.tiers.resolve(hits))
            .unwrap_or_default();
        let expires_at = self.settings.tiers.expires_at(tier, Utc::now());
        match self.artifacts.mark_ready(folder, version, claim.token, artifact_bytes, expires_at) {
            Ok(true) => info!(folder_key = %folder, version_key = %version, artifact = %claim.shared_name, "shared artifact ready"),
            Ok(false) => warn!(folder_key = %folder, version_key = %version, "artifact claim lost before mark_ready"),
            Err(e) => warn!(folder_key = %folder, error = %e, "failed to mark artifact ready"),
        }
    }

    fn release_failed(&self, folder: &FolderKey, version: &VersionKey, token: ClaimToken, summary: &str) {
        match self.artifacts.mark_failed(folder, version, token, summary) {
            Ok(_) => {}
            Err(e) => warn!(folder_key = %folder, error = %e, "failed to mark artifact failed"),
        }
    }

    fn on_progress(&self, job: &JobRecord, active: &ActiveJob, progress: BuildProgress) {
        let mut throttle = active.throttle.lock().unwrap();
        let Some(percent) = throttle.observe_bytes(progress.processed_bytes, progress.total_bytes) else {
            return;
        };
        // A cancellation accepted by another process only shows up in the record.
        match self.lifecycle.jobs().get(job.id) {
            Ok(Some(current)) if current.status != JobStatus::InProgress => {
                info!(job_id = %job.id, status = %current.status, "job left in_progress while building; stopping");
                active.cancel.cancel();
                throttle.seal();
                return;
            }
            Ok(_) => {}
            Err(e) => debug!(job_id = %job.id, error = %e, "status check skipped"),
        }
        self.lifecycle.notifier().notify(
            job.owner_id,
            JobEvent::Progress {
                job_id: job.id,
                progress: percent,
            },
        );
    }

    fn finish(
        &self,
        job: &JobRecord,
        active: &ActiveJob,
        run: Result<Built, RunError>,
    ) -> Result<ProcessOutcome, LifecycleError> {
        let mut throttle = active.throttle.lock().unwrap();
        throttle.seal();

        match run {
            Ok(built) => {
                if self.lifecycle.complete(job, &built.bundle_name)? {
                    return Ok(ProcessOutcome::Completed {
                        cache_hit: built.cache_hit,
                    });
                }
                // A duplicate delivery that completed first owns the same file.
                let completed_elsewhere = self
                    .lifecycle
                    .jobs()
                    .get(job.id)?
                    .is_some_and(|current| current.status == JobStatus::Completed);
                if !completed_elsewhere {
                    let path = self.settings.jobs_root.join(&built.bundle_name);
                    if let Err(e) = fs::remove_file(&path) {
                        warn!(job_id = %job.id, path = %path.display(), error = %e, "failed to remove orphaned bundle");
                    }
                }
                Ok(ProcessOutcome::Skipped(SkipReason::LostRace))
            }
            Err(RunError::Build(BuildError::Cancelled)) => {
                if self.lifecycle.cancel(job)? {
                    return Ok(ProcessOutcome::Cancelled);
                }
                // Whoever won compensated; only a cancellation counts as one here.
                let cancelled = self
                    .lifecycle
                    .jobs()
                    .get(job.id)?
                    .is_some_and(|current| current.status == JobStatus::Cancelled);
                if cancelled {
                    Ok(ProcessOutcome::Cancelled)
                } else {
                    Ok(ProcessOutcome::Skipped(SkipReason::LostRace))
                }
            }
            Err(err) => {
                let category = match &err {
                    RunError::Build(e) => e.category().as_str(),
                    RunError::Panicked(_) => "panic",
                };
                error!(job_id = %job.id, owner_id = %job.owner_id, category, error = %err, "job failed");
                if self.lifecycle.fail(job, JobStatus::InProgress)? {
                    Ok(ProcessOutcome::Failed)
                } else {
                    Ok(ProcessOutcome::Skipped(SkipReason::LostRace))
                }
            }
        }
    }
}

enum CacheDecision {
    Reuse(String),
    Build(Option<HeldClaim>),
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
