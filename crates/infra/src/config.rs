//! Pipeline configuration loaded from `DIRPACK_*` environment variables.
//!
//! Unparseable values fall back to their default with a warning; they never
//! abort startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use dirpack_archive::CompressionLevel;
use dirpack_quota::QuotaPolicy;
use tracing::warn;

/// How a worker reacts to a fingerprint another worker is already building.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheMode {
    /// Build a private copy right away.
    #[default]
    Lenient,
    /// Wait (bounded) for the other build, then fall back to a private copy.
    Strict,
}

impl FromStr for CacheMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lenient" => Ok(Self::Lenient),
            "strict" => Ok(Self::Strict),
            other => Err(format!("unknown cache mode `{other}`")),
        }
    }
}

/// One named worker pool, the queue it drains and how many jobs it builds
/// at once. Several pools may drain the same queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSpec {
    pub name: String,
    pub queue: String,
    pub concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot resolve relative path {path}: {message}")]
    CurrentDir { path: String, message: String },
    #[error("invalid worker pool entry `{0}` (expected name[:concurrency[:queue]])")]
    PoolSpec(String),
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Per-job bundles live here; shared artifacts under `shared/`.
    pub compressed_dirs_root: PathBuf,
    pub backend_url: String,
    pub compression_level: CompressionLevel,
    pub queue_name: String,
    pub worker_pools: Vec<PoolSpec>,
    pub lease: Duration,
    pub poll_interval: Duration,
    pub download_ttl: chrono::Duration,
    pub progress_step: u8,
    pub quota_policy: QuotaPolicy,
    pub cache_mode: CacheMode,
    pub cache_wait: Duration,
    pub artifact_hot_ttl: chrono::Duration,
    pub artifact_warm_ttl: chrono::Duration,
    pub artifact_hot_min_hits: u64,
    pub build_stale_after: chrono::Duration,
    pub max_active_per_owner: u64,
    pub max_active_total: Option<u64>,
    pub queued_timeout: chrono::Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            compressed_dirs_root: PathBuf::from("compressed_dirs"),
            backend_url: "http://localhost:8080".to_string(),
            compression_level: CompressionLevel::default(),
            queue_name: "compression".to_string(),
            worker_pools: vec![PoolSpec {
                name: "compression".to_string(),
                queue: "compression".to_string(),
                concurrency: 1,
            }],
            lease: Duration::from_secs(86_400),
            poll_interval: Duration::from_millis(250),
            download_ttl: chrono::Duration::hours(24),
            progress_step: 5,
            quota_policy: QuotaPolicy::Soft,
            cache_mode: CacheMode::Lenient,
            cache_wait: Duration::from_secs(30),
            artifact_hot_ttl: chrono::Duration::days(90),
            artifact_warm_ttl: chrono::Duration::days(14),
            artifact_hot_min_hits: 3,
            build_stale_after: chrono::Duration::seconds(21_600),
            max_active_per_owner: 1,
            max_active_total: None,
            queued_timeout: chrono::Duration::seconds(900),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests pass a map here).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let root = get("DIRPACK_COMPRESSED_DIRS_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.compressed_dirs_root);
        let compressed_dirs_root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()
                .map_err(|e| ConfigError::CurrentDir {
                    path: root.display().to_string(),
                    message: e.to_string(),
                })?
                .join(root)
        };

        let queue_name = get("DIRPACK_QUEUE_NAME").unwrap_or(defaults.queue_name);
        let worker_pools = match get("DIRPACK_WORKER_POOLS") {
            Some(raw) => parse_pools(&raw, &queue_name)?,
            None => defaults
                .worker_pools
                .into_iter()
                .map(|pool| PoolSpec {
                    queue: queue_name.clone(),
                    ..pool
                })
                .collect(),
        };

        let compression_level = parsed::<u32>(&get, "DIRPACK_COMPRESSION_LEVEL")
            .and_then(|level| {
                let valid = CompressionLevel::new(level);
                if valid.is_none() {
                    warn!(level, "DIRPACK_COMPRESSION_LEVEL outside 0..=9, using default");
                }
                valid
            })
            .unwrap_or(defaults.compression_level);

        let quota_policy = match get("DIRPACK_QUOTA_POLICY") {
            Some(raw) => QuotaPolicy::parse(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "unknown DIRPACK_QUOTA_POLICY, using soft");
                defaults.quota_policy
            }),
            None => defaults.quota_policy,
        };

        Ok(Self {
            compressed_dirs_root,
            backend_url: get("DIRPACK_BACKEND_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.backend_url),
            compression_level,
            queue_name,
            worker_pools,
            lease: positive::<u64>(&get, "DIRPACK_LEASE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease),
            poll_interval: positive::<u64>(&get, "DIRPACK_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            download_ttl: positive::<i64>(&get, "DIRPACK_DOWNLOAD_TTL_HOURS")
                .map(chrono::Duration::hours)
                .unwrap_or(defaults.download_ttl),
            progress_step: positive::<u8>(&get, "DIRPACK_PROGRESS_STEP")
                .filter(|step| *step <= 100)
                .unwrap_or(defaults.progress_step),
            quota_policy,
            cache_mode: parsed::<CacheMode>(&get, "DIRPACK_CACHE_MODE").unwrap_or_default(),
            cache_wait: positive::<u64>(&get, "DIRPACK_CACHE_WAIT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_wait),
            artifact_hot_ttl: positive::<i64>(&get, "DIRPACK_ARTIFACT_HOT_TTL_DAYS")
                .map(chrono::Duration::days)
                .unwrap_or(defaults.artifact_hot_ttl),
            artifact_warm_ttl: positive::<i64>(&get, "DIRPACK_ARTIFACT_WARM_TTL_DAYS")
                .map(chrono::Duration::days)
                .unwrap_or(defaults.artifact_warm_ttl),
            artifact_hot_min_hits: positive::<u64>(&get, "DIRPACK_ARTIFACT_HOT_MIN_HITS")
                .unwrap_or(defaults.artifact_hot_min_hits),
            build_stale_after: positive::<i64>(&get, "DIRPACK_BUILD_STALE_SECS")
                .map(chrono::Duration::seconds)
                .unwrap_or(defaults.build_stale_after),
            max_active_per_owner: positive::<u64>(&get, "DIRPACK_MAX_ACTIVE_PER_OWNER")
                .unwrap_or(defaults.max_active_per_owner),
            max_active_total: positive::<u64>(&get, "DIRPACK_MAX_ACTIVE_TOTAL"),
            queued_timeout: positive::<i64>(&get, "DIRPACK_QUEUED_TIMEOUT_SECS")
                .map(chrono::Duration::seconds)
                .unwrap_or(defaults.queued_timeout),
        })
    }

    /// Directory for content-addressed artifacts shared across owners.
    pub fn shared_artifacts_root(&self) -> PathBuf {
        self.compressed_dirs_root.join("shared")
    }
}

fn parsed<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = get(key)?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "ignoring invalid configuration value");
            None
        }
    }
}

fn positive<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    parsed::<T>(get, key).filter(|v| {
        let ok = *v > T::default();
        if !ok {
            warn!(key, "configuration value must be positive, using default");
        }
        ok
    })
}

/// `name[:concurrency[:queue]]` entries, comma separated. The queue
/// defaults to `default_queue`.
fn parse_pools(raw: &str, default_queue: &str) -> Result<Vec<PoolSpec>, ConfigError> {
    let mut pools = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let mut parts = entry.split(':').map(str::trim);
        let name = parts.next().unwrap_or_default();
        let concurrency: usize = parts
            .next()
            .unwrap_or("1")
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| ConfigError::PoolSpec(entry.to_string()))?;
        let queue = parts.next().unwrap_or(default_queue);
        if name.is_empty() || queue.is_empty() || parts.next().is_some() {
            return Err(ConfigError::PoolSpec(entry.to_string()));
        }
        pools.push(PoolSpec {
            name: name.to_string(),
            queue: queue.to_string(),
            concurrency,
        });
    }
    if pools.is_empty() {
        return Err(ConfigError::PoolSpec(raw.to_string()));
    }
    Ok(pools)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert!(config.compressed_dirs_root.is_absolute());
        assert!(config.compressed_dirs_root.ends_with("compressed_dirs"));
        assert_eq!(config.compression_level.get(), 1);
        assert_eq!(config.progress_step, 5);
        assert_eq!(config.download_ttl, chrono::Duration::hours(24));
        assert_eq!(config.quota_policy, QuotaPolicy::Soft);
        assert_eq!(config.cache_mode, CacheMode::Lenient);
        assert_eq!(config.max_active_total, None);
        assert_eq!(
            config.worker_pools,
            vec![PoolSpec {
                name: "compression".into(),
                queue: "compression".into(),
                concurrency: 1
            }]
        );
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("DIRPACK_COMPRESSED_DIRS_ROOT", "/srv/bundles"),
            ("DIRPACK_BACKEND_URL", "https://api.example.com/"),
            ("DIRPACK_COMPRESSION_LEVEL", "6"),
            ("DIRPACK_WORKER_POOLS", "heavy:1, light:4"),
            ("DIRPACK_QUOTA_POLICY", "hard"),
            ("DIRPACK_CACHE_MODE", "strict"),
            ("DIRPACK_MAX_ACTIVE_TOTAL", "20"),
        ]))
        .unwrap();

        assert_eq!(config.compressed_dirs_root, PathBuf::from("/srv/bundles"));
        assert_eq!(config.shared_artifacts_root(), PathBuf::from("/srv/bundles/shared"));
        assert_eq!(config.backend_url, "https://api.example.com");
        assert_eq!(config.compression_level.get(), 6);
        assert_eq!(config.worker_pools.len(), 2);
        assert_eq!(config.worker_pools[1].concurrency, 4);
        assert_eq!(config.quota_policy, QuotaPolicy::Hard);
        assert_eq!(config.cache_mode, CacheMode::Strict);
        assert_eq!(config.max_active_total, Some(20));
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("DIRPACK_COMPRESSION_LEVEL", "11"),
            ("DIRPACK_PROGRESS_STEP", "0"),
            ("DIRPACK_LEASE_SECS", "soon"),
            ("DIRPACK_QUOTA_POLICY", "maybe"),
        ]))
        .unwrap();
        assert_eq!(config.compression_level.get(), 1);
        assert_eq!(config.progress_step, 5);
        assert_eq!(config.lease, Duration::from_secs(86_400));
        assert_eq!(config.quota_policy, QuotaPolicy::Soft);
    }

    #[test]
    fn malformed_pool_list_is_an_error() {
        let err = PipelineConfig::from_lookup(lookup(&[("DIRPACK_WORKER_POOLS", "a:0")])).unwrap_err();
        assert_eq!(err, ConfigError::PoolSpec("a:0".into()));
        assert!(PipelineConfig::from_lookup(lookup(&[("DIRPACK_WORKER_POOLS", ":2")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup(&[("DIRPACK_WORKER_POOLS", "a:1:")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup(&[("DIRPACK_WORKER_POOLS", "a:1:q:x")])).is_err());
    }

    #[test]
    fn pools_drain_the_configured_queue_unless_they_name_one() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("DIRPACK_QUEUE_NAME", "archives"),
            ("DIRPACK_WORKER_POOLS", "big:2, small:4, thumbs:1:previews"),
        ]))
        .unwrap();
        let queues: Vec<&str> = config.worker_pools.iter().map(|p| p.queue.as_str()).collect();
        assert_eq!(queues, ["archives", "archives", "previews"]);

        let config = PipelineConfig::from_lookup(lookup(&[("DIRPACK_QUEUE_NAME", "archives")])).unwrap();
        assert_eq!(config.worker_pools[0].name, "compression");
        assert_eq!(config.worker_pools[0].queue, "archives");
    }
}
