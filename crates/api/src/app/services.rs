//! Service wiring: stores, queue, realtime channel, worker pools, sweepers.
//!
//! In-memory adapters by default. With the `redis` feature and
//! `USE_PERSISTENT_STORES=true`, stores move to Postgres and the queue and
//! realtime channel to Redis.

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::StatusCode;
use chrono::Utc;
use tracing::{info, warn};

use dirpack_events::{ChannelEvent, EventBus, InMemoryEventBus, Subscription};
use dirpack_infra::artifacts::{ArtifactCache, ArtifactStorage, EvictionSweep, InMemoryArtifactCache};
use dirpack_infra::config::{ConfigError, PipelineConfig};
use dirpack_infra::downloads::{DownloadCleanupSweep, DownloadStore, InMemoryDownloadStore};
use dirpack_infra::event_bus::Notifier;
use dirpack_infra::jobs::{InMemoryJobStore, JobRecordStore};
use dirpack_infra::ledger::{InMemoryQuotaLedger, QuotaLedger};
use dirpack_infra::lifecycle::JobLifecycle;
use dirpack_infra::orchestrator::{JobOrchestrator, OrchestratorSettings};
use dirpack_infra::queue::{InMemoryJobQueue, JobQueue};
use dirpack_infra::submission::{SubmissionService, SubmissionSettings};
use dirpack_infra::supervisor::{SupervisorError, WorkerSupervisor};
use dirpack_infra::workers::{self, WorkerHandle};

use crate::app::errors;

#[cfg(feature = "redis")]
use dirpack_infra::{
    artifacts::PostgresArtifactCache,
    downloads::PostgresDownloadStore,
    event_bus::RedisPubSubEventBus,
    jobs::PostgresJobStore,
    ledger::PostgresQuotaLedger,
    pg::PgRuntime,
    queue::RedisStreamsJobQueue,
};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database: {0}")]
    Database(String),
    #[error("redis: {0}")]
    Redis(String),
    #[error(transparent)]
    Workers(#[from] SupervisorError),
    #[error("failed to start background sweeper: {0}")]
    Sweeper(#[from] std::io::Error),
}

/// Settings that only the HTTP process needs.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Root of the folders owners may request; request paths resolve under it.
    pub files_root: PathBuf,
    /// Run the worker pools inside this process.
    pub run_workers: bool,
    pub eviction_interval: Duration,
    pub reconcile_interval: Duration,
    /// How often expired per-job bundles are deleted.
    pub cleanup_interval: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            files_root: PathBuf::from("files"),
            run_workers: true,
            eviction_interval: Duration::from_secs(3_600),
            reconcile_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(900),
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |key: &str| std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let secs = |key: &str, fallback: Duration| {
            var(key)
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .map_or(fallback, Duration::from_secs)
        };
        Self {
            files_root: var("DIRPACK_FILES_ROOT").map_or(defaults.files_root, PathBuf::from),
            run_workers: var("DIRPACK_RUN_WORKERS")
                .and_then(|v| v.parse::<bool>().ok())
                .unwrap_or(defaults.run_workers),
            eviction_interval: secs("DIRPACK_EVICTION_INTERVAL_SECS", defaults.eviction_interval),
            reconcile_interval: secs("DIRPACK_RECONCILE_INTERVAL_SECS", defaults.reconcile_interval),
            cleanup_interval: secs("DIRPACK_CLEANUP_INTERVAL_SECS", defaults.cleanup_interval),
        }
    }
}

/// Which transport carries realtime events to SSE connections.
#[derive(Clone)]
pub enum Realtime {
    InMemory(Arc<InMemoryEventBus<ChannelEvent>>),
    #[cfg(feature = "redis")]
    Redis(Arc<RedisPubSubEventBus>),
}

impl Realtime {
    fn notifier(&self) -> Arc<dyn Notifier> {
        match self {
            Realtime::InMemory(bus) => bus.clone() as Arc<dyn Notifier>,
            #[cfg(feature = "redis")]
            Realtime::Redis(bus) => bus.clone() as Arc<dyn Notifier>,
        }
    }

    pub fn subscribe(&self) -> Subscription<ChannelEvent> {
        match self {
            Realtime::InMemory(bus) => bus.subscribe(),
            #[cfg(feature = "redis")]
            Realtime::Redis(bus) => bus.subscribe(),
        }
    }
}

pub struct AppServices {
    pub pipeline: PipelineConfig,
    pub api: ApiConfig,
    pub submission: Arc<SubmissionService>,
    pub supervisor: Arc<WorkerSupervisor>,
    pub quota: Arc<dyn QuotaLedger>,
    pub queue: Arc<dyn JobQueue>,
    pub realtime: Realtime,
    sweepers: Mutex<Vec<WorkerHandle>>,
}

/// The store/queue/channel set a deployment runs on.
struct Adapters {
    jobs: Arc<dyn JobRecordStore>,
    quota: Arc<dyn QuotaLedger>,
    downloads: Arc<dyn DownloadStore>,
    artifacts: Arc<dyn ArtifactCache>,
    queue: Arc<dyn JobQueue>,
    realtime: Realtime,
}

pub async fn build_services(pipeline: PipelineConfig, api: ApiConfig) -> Result<AppServices, StartupError> {
    let use_persistent = std::env::var("USE_PERSISTENT_STORES")
        .ok()
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(false);

    let adapters = if use_persistent {
        #[cfg(feature = "redis")]
        {
            persistent_adapters(&pipeline).await?
        }
        #[cfg(not(feature = "redis"))]
        {
            warn!("USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory");
            in_memory_adapters(&pipeline)
        }
    } else {
        in_memory_adapters(&pipeline)
    };

    assemble(pipeline, api, adapters)
}

fn in_memory_adapters(pipeline: &PipelineConfig) -> Adapters {
    Adapters {
        jobs: Arc::new(InMemoryJobStore::new()),
        quota: Arc::new(InMemoryQuotaLedger::new()),
        downloads: Arc::new(InMemoryDownloadStore::new()),
        artifacts: Arc::new(InMemoryArtifactCache::new()),
        queue: Arc::new(InMemoryJobQueue::new(pipeline.queue_name.clone(), pipeline.lease)),
        realtime: Realtime::InMemory(Arc::new(InMemoryEventBus::new())),
    }
}

#[cfg(feature = "redis")]
async fn persistent_adapters(pipeline: &PipelineConfig) -> Result<Adapters, StartupError> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| StartupError::Database("DATABASE_URL must be set when USE_PERSISTENT_STORES=true".into()))?;
    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());

    let pool = sqlx::PgPool::connect(&database_url)
        .await
        .map_err(|e| StartupError::Database(e.to_string()))?;
    let rt = PgRuntime::current(pool).map_err(StartupError::Database)?;

    let queue_name = pipeline.queue_name.clone();
    let lease = pipeline.lease;
    let url = redis_url.clone();
    // Group creation is a blocking Redis round-trip.
    let queue = tokio::task::spawn_blocking(move || RedisStreamsJobQueue::new(url, queue_name, lease))
        .await
        .map_err(|e| StartupError::Redis(e.to_string()))?
        .map_err(|e| StartupError::Redis(e.to_string()))?;
    let bus = RedisPubSubEventBus::new(&redis_url).map_err(|e| StartupError::Redis(e.to_string()))?;

    info!("using Postgres stores and Redis queue/realtime");
    Ok(Adapters {
        jobs: Arc::new(PostgresJobStore::new(rt.clone())),
        quota: Arc::new(PostgresQuotaLedger::new(rt.clone())),
        downloads: Arc::new(PostgresDownloadStore::new(rt.clone())),
        artifacts: Arc::new(PostgresArtifactCache::new(rt)),
        queue: Arc::new(queue),
        realtime: Realtime::Redis(Arc::new(bus)),
    })
}

fn assemble(pipeline: PipelineConfig, api: ApiConfig, adapters: Adapters) -> Result<AppServices, StartupError> {
    let Adapters {
        jobs,
        quota,
        downloads,
        artifacts,
        queue,
        realtime,
    } = adapters;

    let lifecycle = Arc::new(JobLifecycle::new(
        jobs,
        quota.clone(),
        downloads.clone(),
        realtime.notifier(),
        pipeline.backend_url.clone(),
        pipeline.download_ttl,
    ));
    let storage = ArtifactStorage::new(pipeline.shared_artifacts_root());
    let orchestrator = Arc::new(JobOrchestrator::new(
        lifecycle.clone(),
        artifacts.clone(),
        storage.clone(),
        OrchestratorSettings::from_config(&pipeline),
    ));
    let supervisor = Arc::new(
        WorkerSupervisor::new(orchestrator, pipeline.poll_interval).with_queue(queue.clone()),
    );
    let submission = Arc::new(
        SubmissionService::new(
            lifecycle,
            quota.clone(),
            downloads.clone(),
            queue.clone(),
            SubmissionSettings::from_config(&pipeline),
        )
        .with_supervisor(supervisor.clone()),
    );

    if api.run_workers {
        for spec in &pipeline.worker_pools {
            supervisor.start_pool(spec)?;
        }
    }

    let mut sweepers = Vec::new();
    sweepers.push(EvictionSweep::new(artifacts, storage).spawn(api.eviction_interval)?);
    sweepers.push(
        DownloadCleanupSweep::new(downloads, pipeline.compressed_dirs_root.clone()).spawn(api.cleanup_interval)?,
    );
    let reconciler = submission.clone();
    sweepers.push(workers::spawn_periodic("queued-reconciler", api.reconcile_interval, move || {
        reconciler.reconcile_stale_queued(Utc::now()).map(|_| ())
    })?);

    info!(
        run_workers = api.run_workers,
        pools = ?supervisor.running_pools(),
        queue = queue.queue_name(),
        "services ready"
    );

    Ok(AppServices {
        pipeline,
        api,
        submission,
        supervisor,
        quota,
        queue,
        realtime,
        sweepers: Mutex::new(sweepers),
    })
}

impl AppServices {
    /// Stop sweepers and worker pools, waiting for running builds.
    pub fn shutdown(&self) {
        let sweepers: Vec<WorkerHandle> = self.sweepers.lock().unwrap().drain(..).collect();
        for sweeper in sweepers {
            sweeper.shutdown();
        }
        self.supervisor.shutdown();
    }

    /// Map a requested folder onto the files root.
    ///
    /// Returns the normalised relative path and the absolute one. Rejects
    /// parent-directory segments so a request cannot leave the root.
    pub fn resolve_source(&self, requested: &str) -> Result<(String, PathBuf), String> {
        resolve_under(&self.api.files_root, requested)
    }
}

fn resolve_under(root: &Path, requested: &str) -> Result<(String, PathBuf), String> {
    let cleaned = requested.replace('\\', "/");
    let mut parts = Vec::new();
    for component in Path::new(&cleaned).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(format!("path `{requested}` escapes the files root"));
            }
        }
    }
    if parts.is_empty() {
        return Err("path must name a folder below the files root".to_string());
    }

    let root = if root.is_absolute() {
        root.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| format!("cannot resolve files root: {e}"))?
            .join(root)
    };
    let absolute = parts.iter().fold(root, |acc, part| acc.join(part));
    Ok((format!("/{}", parts.join("/")), absolute))
}

/// Run a blocking store call off the async runtime.
pub async fn blocking<T, F>(f: F) -> Result<T, axum::response::Response>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string())
    })
}
