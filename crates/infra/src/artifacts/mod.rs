//! Artifact Cache: reuse of built bundles across owners.
//!
//! - [`ArtifactCache`]: registry rows and the per-fingerprint build claim
//! - [`ArtifactStorage`]: the shared files those rows point at
//! - [`TierPolicy`] / [`EvictionSweep`]: retention and reclamation

pub mod cache;
pub mod eviction;
pub mod postgres;
pub mod storage;
pub mod tier;
pub mod types;

pub use cache::{ArtifactCache, ArtifactCacheError, InMemoryArtifactCache};
pub use eviction::{EvictionReport, EvictionSweep};
pub use postgres::PostgresArtifactCache;
pub use storage::{ArtifactStorage, StorageError};
pub use tier::TierPolicy;
pub use types::{
    ArtifactMeta, ArtifactRecord, ArtifactState, ArtifactStatus, ArtifactTier, ClaimOutcome,
    ClaimToken,
};
