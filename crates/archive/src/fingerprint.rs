//! Folder keys, version keys and bundle names.
//!
//! A `(FolderKey, VersionKey)` pair is the identity of a cached artifact: the
//! folder key says *which* folder, the version key says *which content* of it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use dirpack_core::{DomainError, OwnerId};

/// File extension of every bundle this crate produces.
pub const BUNDLE_EXTENSION: &str = "tar.gz";

const MAX_BASE_LEN: usize = 120;
const VERSION_SUFFIX_LEN: usize = 24;

/// Normalised catalog path of a source folder (`/artists/a/album`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FolderKey(String);

impl FolderKey {
    /// Normalise a raw relative or absolute path.
    ///
    /// Backslashes become `/`, runs of slashes collapse, the result has exactly
    /// one leading `/` and no trailing `/` (the root itself stays `/`).
    /// Whitespace is part of a segment name and is kept.
    pub fn normalize(raw: &str) -> Self {
        let mut out = String::with_capacity(raw.len() + 1);
        for segment in raw.split(['/', '\\']).filter(|s| !s.is_empty()) {
            out.push('/');
            out.push_str(segment);
        }
        if out.is_empty() {
            out.push('/');
        }
        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment, empty for the root.
    pub fn base_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }
}

impl core::fmt::Display for FolderKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content fingerprint of a folder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionKey(String);

impl VersionKey {
    /// SHA-256 (lowercase hex) of `"<folder>|<size>|<mtime-millis>"`.
    pub fn derive(folder: &FolderKey, size_bytes: u64, modified_at_millis: i64) -> Self {
        let fingerprint = format!("{}|{}|{}", folder.as_str(), size_bytes, modified_at_millis);
        Self(hex::encode(Sha256::digest(fingerprint.as_bytes())))
    }

    /// Caller-supplied version, e.g. a catalog revision.
    pub fn explicit(raw: &str) -> Result<Self, DomainError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("version key must not be blank"));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// An explicit non-blank value wins; otherwise derive from the folder stats.
    pub fn resolve(
        explicit: Option<&str>,
        folder: &FolderKey,
        size_bytes: u64,
        modified_at_millis: i64,
    ) -> Self {
        match explicit.map(Self::explicit) {
            Some(Ok(key)) => key,
            _ => Self::derive(folder, size_bytes, modified_at_millis),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for VersionKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// File-system safe rendering of a folder's base name.
///
/// Keeps `[A-Za-z0-9._-]`, turns every other run into a single `-`, trims
/// dashes, caps the length and falls back to `folder`.
pub fn safe_base_name(folder: &FolderKey) -> String {
    let mut out = String::new();
    let mut pending_dash = false;
    for ch in folder.base_name().chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            if ch == '-' {
                pending_dash = true;
                continue;
            }
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch);
        } else {
            pending_dash = true;
        }
    }
    out.truncate(MAX_BASE_LEN);
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "folder".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Name of the shared, content-addressed artifact for a folder version.
pub fn shared_bundle_name(folder: &FolderKey, version: &VersionKey) -> String {
    let suffix: String = version
        .as_str()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(VERSION_SUFFIX_LEN)
        .collect();
    let suffix = if suffix.is_empty() { "version".to_string() } else { suffix };
    format!("{}-{}.{}", safe_base_name(folder), suffix, BUNDLE_EXTENSION)
}

/// Name of the private per-job bundle handed to one owner.
pub fn job_bundle_name(folder: &FolderKey, owner: OwnerId, queue_job_id: &str) -> String {
    let queue_part: String = queue_job_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!(
        "{}-{}-{}.{}",
        safe_base_name(folder),
        owner,
        queue_part,
        BUNDLE_EXTENSION
    )
}
