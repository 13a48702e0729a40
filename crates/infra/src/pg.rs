//! Shared plumbing for the Postgres-backed stores.
//!
//! Store traits are synchronous: the orchestrator calls them from plain OS
//! threads and the API from `spawn_blocking`. Each Postgres store keeps the
//! pool plus a handle to the runtime that owns it and `block_on`s every query.
//! Calling a store from inside an async task would deadlock the runtime; don't.

use std::future::Future;

use sqlx::PgPool;
use tokio::runtime::Handle;

#[derive(Debug, Clone)]
pub struct PgRuntime {
    pool: PgPool,
    handle: Handle,
}

impl PgRuntime {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    /// Capture the runtime the caller is running on.
    pub fn current(pool: PgPool) -> Result<Self, String> {
        let handle = Handle::try_current()
            .map_err(|_| "Postgres stores must be constructed inside a tokio runtime".to_string())?;
        Ok(Self::new(pool, handle))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.handle.block_on(fut)
    }
}

/// Render a sqlx error with the operation it came from.
pub fn describe(operation: &str, err: sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => format!(
            "database error in {operation} ({}): {}",
            db_err.code().as_deref().unwrap_or("unknown"),
            db_err.message()
        ),
        sqlx::Error::PoolClosed => format!("connection pool closed in {operation}"),
        other => format!("sqlx error in {operation}: {other}"),
    }
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

/// Byte counts are `u64` in the domain and `BIGINT` in the schema.
pub fn to_db_bytes(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

pub fn from_db_bytes(bytes: i64) -> u64 {
    u64::try_from(bytes).unwrap_or(0)
}
