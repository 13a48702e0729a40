//! Starts, stops and inspects the named worker pools of this process.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;

use dirpack_core::JobId;

use crate::config::PoolSpec;
use crate::orchestrator::JobOrchestrator;
use crate::queue::JobQueue;
use crate::workers::{WorkerPool, WorkerStats};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("worker pool `{0}` is already running")]
    AlreadyRunning(String),
    #[error("no queue registered for worker pool `{0}`")]
    UnknownQueue(String),
    #[error("failed to spawn worker pool `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Owns every [`WorkerPool`]. Each pool drains the registered queue its spec names.
pub struct WorkerSupervisor {
    orchestrator: Arc<JobOrchestrator>,
    queues: HashMap<String, Arc<dyn JobQueue>>,
    poll_interval: Duration,
    pools: Mutex<HashMap<String, WorkerPool>>,
}

impl WorkerSupervisor {
    pub fn new(orchestrator: Arc<JobOrchestrator>, poll_interval: Duration) -> Self {
        Self {
            orchestrator,
            queues: HashMap::new(),
            poll_interval,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queues.insert(queue.queue_name().to_string(), queue);
        self
    }

    pub fn start_pool(&self, spec: &PoolSpec) -> Result<(), SupervisorError> {
        let mut pools = self.pools.lock().unwrap();
        if pools.contains_key(&spec.name) {
            return Err(SupervisorError::AlreadyRunning(spec.name.clone()));
        }
        let queue = self
            .queues
            .get(&spec.queue)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownQueue(spec.queue.clone()))?;
        let pool = WorkerPool::spawn(
            &spec.name,
            spec.concurrency,
            queue,
            self.orchestrator.clone(),
            self.poll_interval,
        )
        .map_err(|source| SupervisorError::Spawn {
            name: spec.name.clone(),
            source,
        })?;
        pools.insert(spec.name.clone(), pool);
        Ok(())
    }

    /// Returns `false` if no such pool was running.
    pub fn stop_pool(&self, name: &str) -> bool {
        let pool = self.pools.lock().unwrap().remove(name);
        match pool {
            Some(pool) => {
                pool.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn shutdown(&self) {
        let pools: Vec<WorkerPool> = self.pools.lock().unwrap().drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.shutdown();
        }
        info!("all worker pools stopped");
    }

    /// Signal a job running in any pool of this process.
    pub fn cancel(&self, job_id: JobId) -> bool {
        self.pools.lock().unwrap().values().any(|pool| pool.cancel(job_id))
    }

    pub fn stats(&self) -> BTreeMap<String, WorkerStats> {
        self.pools
            .lock()
            .unwrap()
            .iter()
            .map(|(name, pool)| (name.clone(), pool.stats()))
            .collect()
    }

    pub fn running_pools(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{ArtifactStorage, InMemoryArtifactCache};
    use crate::config::PipelineConfig;
    use crate::downloads::InMemoryDownloadStore;
    use crate::event_bus::RecordingNotifier;
    use crate::jobs::InMemoryJobStore;
    use crate::ledger::InMemoryQuotaLedger;
    use crate::lifecycle::JobLifecycle;
    use crate::orchestrator::OrchestratorSettings;
    use crate::queue::InMemoryJobQueue;

    fn supervisor(root: &std::path::Path) -> WorkerSupervisor {
        let lifecycle = Arc::new(JobLifecycle::new(
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryQuotaLedger::new()),
            Arc::new(InMemoryDownloadStore::new()),
            RecordingNotifier::new(),
            "http://files.test",
            chrono::Duration::hours(1),
        ));
        let mut settings = OrchestratorSettings::from_config(&PipelineConfig::default());
        settings.jobs_root = root.to_path_buf();
        let orchestrator = Arc::new(JobOrchestrator::new(
            lifecycle,
            Arc::new(InMemoryArtifactCache::new()),
            ArtifactStorage::new(root.join("shared")),
            settings,
        ));
        WorkerSupervisor::new(orchestrator, Duration::from_millis(10))
            .with_queue(Arc::new(InMemoryJobQueue::new("compression", Duration::from_secs(60))))
    }

    fn spec(name: &str, queue: &str, concurrency: usize) -> PoolSpec {
        PoolSpec {
            name: name.to_string(),
            queue: queue.to_string(),
            concurrency,
        }
    }

    #[test]
    fn pools_start_once_and_stop_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());

        sup.start_pool(&spec("compression", "compression", 2)).unwrap();
        assert!(matches!(
            sup.start_pool(&spec("compression", "compression", 1)),
            Err(SupervisorError::AlreadyRunning(_))
        ));
        assert!(matches!(
            sup.start_pool(&spec("thumbnails", "thumbnails", 1)),
            Err(SupervisorError::UnknownQueue(_))
        ));

        let stats = sup.stats();
        assert_eq!(stats["compression"].concurrency, 2);
        assert_eq!(stats["compression"].processed, 0);

        assert!(!sup.cancel(JobId::new()));
        assert!(sup.stop_pool("compression"));
        assert!(!sup.stop_pool("compression"));
        assert!(sup.running_pools().is_empty());
    }

    #[test]
    fn several_pools_can_drain_one_queue() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());

        sup.start_pool(&spec("heavy", "compression", 1)).unwrap();
        sup.start_pool(&spec("light", "compression", 3)).unwrap();
        assert_eq!(sup.running_pools(), ["heavy", "light"]);
        assert_eq!(sup.stats()["light"].concurrency, 3);

        let err = sup.start_pool(&spec("previews", "thumbnails", 1)).unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownQueue(ref queue) if queue == "thumbnails"));
        sup.shutdown();
        assert!(sup.running_pools().is_empty());
    }
}
