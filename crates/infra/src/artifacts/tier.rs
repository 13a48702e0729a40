use chrono::{DateTime, Duration, Utc};

use super::types::ArtifactTier;

/// Retention rules for cached bundles.
///
/// A folder turns `hot` once it has been served from cache `hot_min_hits`
/// times; each tier keeps its bundles for its own TTL after the last hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPolicy {
    pub hot_min_hits: u64,
    pub hot_ttl: Duration,
    pub warm_ttl: Duration,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            hot_min_hits: 3,
            hot_ttl: Duration::days(90),
            warm_ttl: Duration::days(14),
        }
    }
}

impl TierPolicy {
    pub fn resolve(&self, folder_hits: u64) -> ArtifactTier {
        if folder_hits >= self.hot_min_hits {
            ArtifactTier::Hot
        } else {
            ArtifactTier::Warm
        }
    }

    pub fn ttl(&self, tier: ArtifactTier) -> Duration {
        match tier {
            ArtifactTier::Hot => self.hot_ttl,
            ArtifactTier::Warm => self.warm_ttl,
        }
    }

    pub fn expires_at(&self, tier: ArtifactTier, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.ttl(tier)
    }
}
