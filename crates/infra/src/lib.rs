//! Infrastructure layer of the archive pipeline: stores, queue, realtime
//! channel, configuration and the worker machinery that ties them together.

pub mod artifacts;
pub mod config;
pub mod downloads;
pub mod event_bus;
pub mod jobs;
pub mod ledger;
pub mod lifecycle;
pub mod orchestrator;
pub mod pg;
pub mod queue;
pub mod submission;
pub mod supervisor;
pub mod workers;

#[cfg(test)]
mod integration_tests;
