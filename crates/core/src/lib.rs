//! `dirpack-core`: identifiers and error primitives shared by the archive pipeline.
//!
//! Nothing in here performs IO.

pub mod error;
pub mod id;

pub use error::DomainError;
pub use id::{DownloadHandleId, JobId, OwnerId, ReservationId};
