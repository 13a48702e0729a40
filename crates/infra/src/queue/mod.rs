//! Durable job queue adapters.
//!
//! The queue is treated as an opaque at-least-once delivery mechanism with a
//! lease per in-flight message: a consumer that dies mid-job loses its lease
//! and the message is delivered again, possibly to another worker.

pub mod memory;
pub mod message;
#[cfg(feature = "redis")]
pub mod redis_streams;

use std::time::Duration;

pub use memory::InMemoryJobQueue;
pub use message::{Delivery, JobMessage};
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsJobQueue;

pub trait JobQueue: Send + Sync {
    fn queue_name(&self) -> &str;

    fn enqueue(&self, queue_job_id: &str, message: &JobMessage) -> Result<(), QueueError>;

    /// Lease the next message, waiting up to `wait` for one to appear.
    fn reserve(&self, consumer: &str, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Finish a delivery. Acknowledging a lease that already expired is a no-op.
    fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Messages waiting or in flight.
    fn depth(&self) -> Result<usize, QueueError>;
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),
    #[error("queue command error: {0}")]
    Command(String),
    #[error("malformed queue message: {0}")]
    Malformed(String),
}
