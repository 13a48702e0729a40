//! Background thread plumbing shared by the worker pools and sweepers.

use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

pub mod pool;

pub use pool::{WorkerPool, WorkerStats};

/// Handle to control and join a background thread.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn new(shutdown: mpsc::Sender<()>, join: thread::JoinHandle<()>) -> Self {
        Self {
            shutdown,
            join: Some(join),
        }
    }

    /// Ask the thread to stop without waiting for it.
    pub fn signal(&self) {
        let _ = self.shutdown.send(());
    }

    /// Request graceful shutdown and wait for the thread to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                warn!("background thread panicked before shutdown");
            }
        }
    }
}

/// Run `tick` every `interval` on a named thread until shut down.
///
/// Errors from `tick` are logged and the schedule continues.
pub fn spawn_periodic<F, E>(name: &str, interval: Duration, mut tick: F) -> io::Result<WorkerHandle>
where
    F: FnMut() -> Result<(), E> + Send + 'static,
    E: core::fmt::Debug,
{
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    let thread_name = name.to_string();
    let join = thread::Builder::new().name(thread_name.clone()).spawn(move || {
        info!(worker = %thread_name, "periodic worker started");
        loop {
            match shutdown_rx.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(err) = tick() {
                        warn!(worker = %thread_name, error = ?err, "periodic tick failed");
                    }
                }
            }
        }
        info!(worker = %thread_name, "periodic worker stopped");
    })?;
    Ok(WorkerHandle::new(shutdown_tx, join))
}
