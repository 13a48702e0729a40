//! Redis Streams job queue (durable, at-least-once).
//!
//! - **Stream**: `dirpack:queue:<name>`, one entry per submitted job
//! - **Consumer group**: one per queue; every worker slot is a consumer
//! - **Lease**: an entry pending longer than the lease is claimed by the next
//!   consumer that asks (XPENDING + XCLAIM), which is how a dead worker's job
//!   is redelivered
//! - **Ack**: XACK + XDEL, so XLEN is the queue depth

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use super::message::{Delivery, JobMessage};
use super::{JobQueue, QueueError};

const STREAM_PREFIX: &str = "dirpack:queue";
const GROUP: &str = "workers";
const CLAIM_SCAN: usize = 10;

#[derive(Debug, Clone)]
pub struct RedisStreamsJobQueue {
    client: Arc<redis::Client>,
    name: String,
    stream_key: String,
    lease: Duration,
}

impl RedisStreamsJobQueue {
    pub fn new(redis_url: impl AsRef<str>, name: impl Into<String>, lease: Duration) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(|e| QueueError::Connection(e.to_string()))?;
        let name = name.into();
        let queue = Self {
            client: Arc::new(client),
            stream_key: format!("{STREAM_PREFIX}:{name}"),
            name,
            lease,
        };
        queue.ensure_group()?;
        Ok(queue)
    }

    fn connection(&self) -> Result<redis::Connection, QueueError> {
        self.client
            .get_connection()
            .map_err(|e| QueueError::Connection(e.to_string()))
    }

    /// Create the consumer group (and stream) if missing.
    fn ensure_group(&self) -> Result<(), QueueError> {
        let mut conn = self.connection()?;
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(GROUP)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);
        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    /// Take over an entry whose lease ran out, if there is one.
    fn claim_abandoned(&self, conn: &mut redis::Connection, consumer: &str) -> Result<Option<Delivery>, QueueError> {
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(GROUP)
            .arg("-")
            .arg("+")
            .arg(CLAIM_SCAN)
            .query(conn)
            .map_err(|e| QueueError::Command(format!("XPENDING failed: {e}")))?;

        let lease_ms = u64::try_from(self.lease.as_millis()).unwrap_or(u64::MAX);
        for (entry_id, previous_owner, idle_ms, deliveries) in pending {
            if idle_ms < lease_ms {
                continue;
            }
            let claimed: Vec<redis::Value> = redis::cmd("XCLAIM")
                .arg(&self.stream_key)
                .arg(GROUP)
                .arg(consumer)
                .arg(lease_ms)
                .arg(&entry_id)
                .query(conn)
                .map_err(|e| QueueError::Command(format!("XCLAIM failed: {e}")))?;

            // Another consumer may have claimed it between the two calls.
            if let Some(entry) = claimed.into_iter().next() {
                warn!(queue = %self.name, entry_id = %entry_id, previous_owner = %previous_owner, "lease expired; redelivering");
                let attempt = u32::try_from(deliveries).unwrap_or(u32::MAX).saturating_add(1);
                return parse_entry(entry, attempt).map(Some);
            }
        }
        Ok(None)
    }
}

impl JobQueue for RedisStreamsJobQueue {
    fn queue_name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, message), fields(queue = %self.name, job_id = %message.job_record_id), err)]
    fn enqueue(&self, queue_job_id: &str, message: &JobMessage) -> Result<(), QueueError> {
        let payload = serde_json::to_string(message).map_err(|e| QueueError::Malformed(e.to_string()))?;
        let mut conn = self.connection()?;
        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("queue_job_id")
            .arg(queue_job_id)
            .arg("payload")
            .arg(&payload)
            .query(&mut conn)
            .map_err(|e| QueueError::Command(format!("XADD failed: {e}")))?;
        Ok(())
    }

    fn reserve(&self, consumer: &str, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection()?;
        if let Some(delivery) = self.claim_abandoned(&mut conn, consumer)? {
            return Ok(Some(delivery));
        }

        let block_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: Option<Vec<(String, Vec<redis::Value>)>> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(GROUP)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query(&mut conn)
            .map_err(|e| QueueError::Command(format!("XREADGROUP failed: {e}")))?;

        let entry = reply
            .into_iter()
            .flatten()
            .flat_map(|(_, entries)| entries)
            .next();
        match entry {
            Some(entry) => {
                let delivery = parse_entry(entry, 1)?;
                debug!(queue = %self.name, consumer, queue_job_id = %delivery.queue_job_id, "message leased");
                Ok(Some(delivery))
            }
            None => Ok(None),
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection()?;
        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(GROUP)
            .arg(&delivery.lease_token)
            .query(&mut conn)
            .map_err(|e| QueueError::Command(format!("XACK failed: {e}")))?;
        let _: u64 = redis::cmd("XDEL")
            .arg(&self.stream_key)
            .arg(&delivery.lease_token)
            .query(&mut conn)
            .map_err(|e| QueueError::Command(format!("XDEL failed: {e}")))?;
        Ok(())
    }

    fn depth(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection()?;
        let len: usize = redis::cmd("XLEN")
            .arg(&self.stream_key)
            .query(&mut conn)
            .map_err(|e| QueueError::Command(format!("XLEN failed: {e}")))?;
        Ok(len)
    }
}

/// Entry shape: `[id, [field, value, ...]]`. The entry id doubles as the lease token.
fn parse_entry(entry: redis::Value, attempt: u32) -> Result<Delivery, QueueError> {
    let redis::Value::Bulk(parts) = entry else {
        return Err(QueueError::Malformed("stream entry is not an array".into()));
    };
    let mut parts = parts.into_iter();
    let entry_id = match parts.next() {
        Some(redis::Value::Data(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => return Err(QueueError::Malformed("stream entry has no id".into())),
    };
    let Some(redis::Value::Bulk(fields)) = parts.next() else {
        return Err(QueueError::Malformed(format!("entry {entry_id} has no fields")));
    };

    let mut queue_job_id = None;
    let mut payload = None;
    for pair in fields.chunks(2) {
        if let [redis::Value::Data(key), redis::Value::Data(value)] = pair {
            match key.as_slice() {
                b"queue_job_id" => queue_job_id = Some(String::from_utf8_lossy(value).into_owned()),
                b"payload" => payload = Some(value.clone()),
                _ => {}
            }
        }
    }

    let queue_job_id = queue_job_id.ok_or_else(|| QueueError::Malformed(format!("entry {entry_id} missing queue_job_id")))?;
    let payload = payload.ok_or_else(|| QueueError::Malformed(format!("entry {entry_id} missing payload")))?;
    let message: JobMessage =
        serde_json::from_slice(&payload).map_err(|e| QueueError::Malformed(format!("entry {entry_id}: {e}")))?;

    Ok(Delivery {
        queue_job_id,
        message,
        attempt,
        lease_token: entry_id,
    })
}
