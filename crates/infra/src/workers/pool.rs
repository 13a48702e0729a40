//! A named pool of worker threads draining one queue.

use std::io;
use std::sync::mpsc::{self, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info, warn};

use dirpack_core::JobId;

use super::WorkerHandle;
use crate::orchestrator::{JobOrchestrator, ProcessOutcome};
use crate::queue::JobQueue;

/// Counters for one pool, as served by the admin endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub concurrency: usize,
    pub processed: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub skipped: u64,
    pub cache_hits: u64,
    pub in_flight: u64,
    /// Deliveries left unacknowledged because a store was unreachable.
    pub errors: u64,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: ProcessOutcome) {
        self.processed += 1;
        match outcome {
            ProcessOutcome::Completed { cache_hit } => {
                self.completed += 1;
                if cache_hit {
                    self.cache_hits += 1;
                }
            }
            ProcessOutcome::Failed => self.failed += 1,
            ProcessOutcome::Cancelled => self.cancelled += 1,
            ProcessOutcome::Skipped(_) => self.skipped += 1,
        }
    }
}

pub struct WorkerPool {
    name: String,
    orchestrator: Arc<JobOrchestrator>,
    stats: Arc<Mutex<WorkerStats>>,
    started: Instant,
    handles: Vec<WorkerHandle>,
}

impl WorkerPool {
    /// Start `concurrency` threads, each building one job at a time.
    pub fn spawn(
        name: &str,
        concurrency: usize,
        queue: Arc<dyn JobQueue>,
        orchestrator: Arc<JobOrchestrator>,
        poll_interval: Duration,
    ) -> io::Result<Self> {
        let stats = Arc::new(Mutex::new(WorkerStats {
            concurrency,
            ..WorkerStats::default()
        }));
        let mut pool = Self {
            name: name.to_string(),
            orchestrator: orchestrator.clone(),
            stats: stats.clone(),
            started: Instant::now(),
            handles: Vec::with_capacity(concurrency),
        };

        for slot in 0..concurrency {
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
            let consumer = format!("{name}-{slot}-{}", std::process::id());
            let queue = queue.clone();
            let orchestrator = orchestrator.clone();
            let stats = stats.clone();
            let spawned = thread::Builder::new().name(consumer.clone()).spawn(move || {
                info!(worker = %consumer, queue = queue.queue_name(), "worker started");
                loop {
                    match shutdown_rx.try_recv() {
                        Ok(()) | Err(TryRecvError::Disconnected) => break,
                        Err(TryRecvError::Empty) => {}
                    }
                    work_once(&consumer, queue.as_ref(), &orchestrator, &stats, poll_interval);
                }
                info!(worker = %consumer, "worker stopped");
            });
            match spawned {
                Ok(join) => pool.handles.push(WorkerHandle::new(shutdown_tx, join)),
                Err(e) => {
                    pool.shutdown();
                    return Err(e);
                }
            }
        }

        info!(pool = %name, concurrency, "worker pool started");
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancel a job if one of this pool's threads is building it.
    pub fn cancel(&self, job_id: JobId) -> bool {
        self.orchestrator.cancel(job_id)
    }

    pub fn stats(&self) -> WorkerStats {
        let mut stats = self.stats.lock().unwrap().clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    /// Stop taking new jobs and wait for the running ones to finish.
    pub fn shutdown(self) {
        for handle in &self.handles {
            handle.signal();
        }
        for handle in self.handles {
            handle.shutdown();
        }
        info!(pool = %self.name, "worker pool stopped");
    }
}

fn work_once(
    consumer: &str,
    queue: &dyn JobQueue,
    orchestrator: &JobOrchestrator,
    stats: &Mutex<WorkerStats>,
    poll_interval: Duration,
) {
    let delivery = match queue.reserve(consumer, poll_interval) {
        Ok(Some(delivery)) => delivery,
        Ok(None) => return,
        Err(e) => {
            warn!(worker = %consumer, error = %e, "queue unavailable");
            thread::sleep(poll_interval);
            return;
        }
    };

    stats.lock().unwrap().in_flight += 1;
    let result = orchestrator.process_delivery(&delivery);
    let mut s = stats.lock().unwrap();
    s.in_flight -= 1;
    match result {
        Ok(outcome) => {
            s.record(outcome);
            drop(s);
            if let Err(e) = queue.ack(&delivery) {
                warn!(worker = %consumer, queue_job_id = %delivery.queue_job_id, error = %e, "ack failed; job may be redelivered");
            }
        }
        Err(e) => {
            s.errors += 1;
            drop(s);
            error!(
                worker = %consumer,
                queue_job_id = %delivery.queue_job_id,
                attempt = delivery.attempt,
                error = %e,
                "job left for redelivery"
            );
        }
    }
}
