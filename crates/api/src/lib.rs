//! HTTP surface of the archive pipeline: submission, cancellation, job
//! history, quota snapshots and the per-owner event stream.

pub mod app;
pub mod context;
pub mod middleware;
