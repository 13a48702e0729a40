//! User-facing download handles and reclamation of their bundles.

pub mod cleanup;
pub mod postgres;
pub mod store;
pub mod types;

pub use cleanup::{CleanupReport, DownloadCleanupSweep};
pub use postgres::PostgresDownloadStore;
pub use store::{DownloadStore, DownloadStoreError, InMemoryDownloadStore};
pub use types::{DownloadHandle, download_url};
