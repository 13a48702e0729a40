//! Real-time channel wiring for the job pipeline.
//!
//! The bus mechanics live in `dirpack-events`. This module adds the
//! fire-and-forget [`Notifier`] the pipeline publishes through, plus an
//! optional Redis pub/sub transport for multi-process deployments.

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisBusError, RedisPubSubEventBus};

use std::sync::{Arc, Mutex};

use tracing::warn;

use dirpack_core::OwnerId;
use dirpack_events::{ChannelEvent, EventBus, JobEvent};

/// Publish side of the real-time channel, as seen by business logic.
///
/// A failed publish is logged by the implementation and never reaches job
/// state, so nothing is returned.
pub trait Notifier: Send + Sync {
    fn notify(&self, owner: OwnerId, event: JobEvent);
}

impl<B> Notifier for B
where
    B: EventBus<ChannelEvent>,
{
    fn notify(&self, owner: OwnerId, event: JobEvent) {
        let job_id = event.job_id();
        let kind = event.kind();
        if let Err(e) = self.publish(ChannelEvent::new(owner, event)) {
            warn!(job_id = %job_id, owner_id = %owner, kind, error = ?e, "realtime publish failed");
        }
    }
}

/// Notifier that records everything it is handed. Test/dev use.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(OwnerId, JobEvent)>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<(OwnerId, JobEvent)> {
        self.events.lock().unwrap().clone()
    }

    /// Events for one job, in publication order.
    pub fn for_job(&self, job_id: dirpack_core::JobId) -> Vec<JobEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.job_id() == job_id)
            .map(|(_, e)| e.clone())
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, owner: OwnerId, event: JobEvent) {
        self.events.lock().unwrap().push((owner, event));
    }
}
