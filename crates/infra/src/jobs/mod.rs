//! Persisted job records.
//!
//! A job record lives independently of the durable queue's own bookkeeping:
//! it is what cancellation, idempotent terminal handling and user-facing
//! history read. Records are never deleted here.

pub mod postgres;
pub mod store;
pub mod types;

pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobRecordStore, JobStoreError};
pub use types::{JobRecord, JobStatus};
