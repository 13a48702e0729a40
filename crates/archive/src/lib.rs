//! Archive Builder and folder fingerprinting.
//!
//! Everything here is synchronous, blocking file IO. Callers run it on a
//! dedicated worker thread, never on a request-serving runtime thread.

pub mod builder;
pub mod cancel;
pub mod fingerprint;
pub mod measure;
pub mod progress;

pub use builder::{
    ArchiveBuilder, BuildError, BuildErrorCategory, BuildOutcome, BuildProgress, BuildRequest,
    CompressionLevel,
};
pub use cancel::CancelFlag;
pub use fingerprint::{
    BUNDLE_EXTENSION, FolderKey, VersionKey, job_bundle_name, safe_base_name, shared_bundle_name,
};
pub use measure::{FolderStats, measure_folder};
pub use progress::ProgressThrottle;
