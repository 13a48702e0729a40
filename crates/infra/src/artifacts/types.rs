use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use dirpack_archive::{FolderKey, VersionKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Building,
    Ready,
    Failed,
}

impl ArtifactStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactStatus::Building => "building",
            ArtifactStatus::Ready => "ready",
            ArtifactStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "building" => Some(Self::Building),
            "ready" => Some(Self::Ready),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Retention class of a cached bundle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactTier {
    /// Frequently requested folders; long retention.
    Hot,
    #[default]
    Warm,
}

impl ArtifactTier {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactTier::Hot => "hot",
            ArtifactTier::Warm => "warm",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "hot" => Some(Self::Hot),
            "warm" => Some(Self::Warm),
            _ => None,
        }
    }
}

/// Proof of a successful `building` claim. Only the holder may finish the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimToken(Uuid);

impl ClaimToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ClaimToken {
    fn default() -> Self {
        Self::new()
    }
}

/// One cached bundle per `(folder_key, version_key)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRecord {
    pub folder_key: FolderKey,
    pub version_key: VersionKey,
    pub artifact_name: String,
    pub status: ArtifactStatus,
    pub source_size_bytes: u64,
    pub artifact_size_bytes: Option<u64>,
    pub tier: ArtifactTier,
    pub hit_count: u64,
    pub error_summary: Option<String>,
    pub claim_token: Option<ClaimToken>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ArtifactRecord {
    pub fn building(
        folder_key: FolderKey,
        version_key: VersionKey,
        meta: &ArtifactMeta,
        token: ClaimToken,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            folder_key,
            version_key,
            artifact_name: meta.artifact_name.clone(),
            status: ArtifactStatus::Building,
            source_size_bytes: meta.source_size_bytes,
            artifact_size_bytes: None,
            tier: meta.tier,
            hit_count: 0,
            error_summary: None,
            claim_token: Some(token),
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }

    /// A `building` row whose builder has gone quiet for too long.
    pub fn is_stale_build(&self, stale_before: DateTime<Utc>) -> bool {
        self.status == ArtifactStatus::Building && self.updated_at < stale_before
    }
}

/// What a claimant wants recorded alongside its `building` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactMeta {
    pub artifact_name: String,
    pub source_size_bytes: u64,
    pub tier: ArtifactTier,
}

/// Cache lookup result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactState {
    Absent,
    Building,
    /// Reusable bundle stored under `artifact_name` in shared storage.
    Ready { artifact_name: String, artifact_size_bytes: u64 },
    Failed,
}

impl ArtifactState {
    pub fn of(record: Option<&ArtifactRecord>) -> Self {
        match record {
            None => ArtifactState::Absent,
            Some(r) => match r.status {
                ArtifactStatus::Building => ArtifactState::Building,
                ArtifactStatus::Failed => ArtifactState::Failed,
                ArtifactStatus::Ready => ArtifactState::Ready {
                    artifact_name: r.artifact_name.clone(),
                    artifact_size_bytes: r.artifact_size_bytes.unwrap_or(0),
                },
            },
        }
    }
}

/// Result of [`crate::artifacts::ArtifactCache::claim_building`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller now owns the build.
    Claimed(ClaimToken),
    /// Someone else holds the row; here is what they hold.
    Held(ArtifactState),
}
