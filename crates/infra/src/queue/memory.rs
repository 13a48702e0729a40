//! In-process queue with lease expiry, for tests and single-binary deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use super::message::{Delivery, JobMessage};
use super::{JobQueue, QueueError};

#[derive(Debug, Clone)]
struct Entry {
    queue_job_id: String,
    message: JobMessage,
    attempt: u32,
}

#[derive(Debug)]
struct Lease {
    entry: Entry,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Entry>,
    leased: HashMap<String, Lease>,
}

impl State {
    /// Put every lease past its deadline back at the head of the queue.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(token, _)| token.clone())
            .collect();
        for token in expired {
            if let Some(lease) = self.leased.remove(&token) {
                warn!(queue_job_id = %lease.entry.queue_job_id, attempt = lease.entry.attempt, "lease expired; redelivering");
                self.ready.push_front(lease.entry);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.leased.values().map(|l| l.deadline).min()
    }
}

#[derive(Debug)]
pub struct InMemoryJobQueue {
    name: String,
    lease: Duration,
    state: Mutex<State>,
    available: Condvar,
}

impl InMemoryJobQueue {
    pub fn new(name: impl Into<String>, lease: Duration) -> Self {
        Self {
            name: name.into(),
            lease,
            state: Mutex::new(State::default()),
            available: Condvar::new(),
        }
    }
}

impl JobQueue for InMemoryJobQueue {
    fn queue_name(&self) -> &str {
        &self.name
    }

    fn enqueue(&self, queue_job_id: &str, message: &JobMessage) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        state.ready.push_back(Entry {
            queue_job_id: queue_job_id.to_string(),
            message: message.clone(),
            attempt: 0,
        });
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    fn reserve(&self, consumer: &str, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let give_up = Instant::now() + wait;
        let mut state = self.state.lock().unwrap();
        loop {
            let now = Instant::now();
            state.reclaim_expired(now);

            if let Some(mut entry) = state.ready.pop_front() {
                entry.attempt += 1;
                let lease_token = Uuid::now_v7().simple().to_string();
                let delivery = Delivery {
                    queue_job_id: entry.queue_job_id.clone(),
                    message: entry.message.clone(),
                    attempt: entry.attempt,
                    lease_token: lease_token.clone(),
                };
                state.leased.insert(
                    lease_token,
                    Lease {
                        entry,
                        deadline: now + self.lease,
                    },
                );
                debug!(queue = %self.name, consumer, queue_job_id = %delivery.queue_job_id, attempt = delivery.attempt, "message leased");
                return Ok(Some(delivery));
            }

            if now >= give_up {
                return Ok(None);
            }
            let wake_at = state.next_deadline().map_or(give_up, |d| d.min(give_up));
            let (guard, _) = self
                .available
                .wait_timeout(state, wake_at.saturating_duration_since(now))
                .unwrap();
            state = guard;
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.state.lock().unwrap().leased.remove(&delivery.lease_token);
        Ok(())
    }

    fn depth(&self) -> Result<usize, QueueError> {
        let state = self.state.lock().unwrap();
        Ok(state.ready.len() + state.leased.len())
    }
}
