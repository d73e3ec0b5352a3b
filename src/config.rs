use crate::cache::CacheConfig;
use crate::failed_ops::RetryPolicy;
use crate::lease::{default_owner, DEFAULT_LEASE_TTL_MS};
use crate::store::{DEFAULT_MAX_SNAPSHOT_AGE_MS, DEFAULT_PREFIX};
use std::path::{Path, PathBuf};

/// Configuration for a [`crate::SyncManager`], loaded from environment variables.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base directory; the store and the failed-operations journal live
    /// in subdirectories.
    pub data_dir: PathBuf,
    /// File-name prefix for store keys.
    pub store_prefix: String,
    /// Oldest local snapshot a read may fall back to.
    pub max_snapshot_age_ms: u64,
    pub cache: CacheConfig,
    pub retry: RetryPolicy,
    pub lease_ttl_ms: u64,
    /// Lease owner name for writes made by this process.
    pub owner: String,
    /// How often the backend is probed for reachability.
    pub probe_interval_ms: u64,
    /// How often expired leases are swept.
    pub sweep_interval_ms: u64,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn parse_delays(raw: &str) -> Option<Vec<u64>> {
    let delays: Vec<u64> = raw
        .split(',')
        .map(|s| s.trim().parse().ok())
        .collect::<Option<_>>()?;
    (!delays.is_empty()).then_some(delays)
}

impl SyncConfig {
    /// Load config from `LEADSYNC_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults_cache = CacheConfig::default();
        let defaults_retry = RetryPolicy::default();

        Self {
            data_dir: PathBuf::from(
                std::env::var("LEADSYNC_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            ),
            store_prefix: std::env::var("LEADSYNC_STORE_PREFIX")
                .unwrap_or_else(|_| DEFAULT_PREFIX.to_string()),
            max_snapshot_age_ms: env_parse("LEADSYNC_MAX_SNAPSHOT_AGE_MS")
                .unwrap_or(DEFAULT_MAX_SNAPSHOT_AGE_MS),
            cache: CacheConfig {
                default_ttl_ms: env_parse("LEADSYNC_CACHE_TTL_MS")
                    .unwrap_or(defaults_cache.default_ttl_ms),
                recent_change_ttl_ms: env_parse("LEADSYNC_CACHE_RECENT_TTL_MS")
                    .unwrap_or(defaults_cache.recent_change_ttl_ms),
                recent_change_window_ms: env_parse("LEADSYNC_CACHE_RECENT_WINDOW_MS")
                    .unwrap_or(defaults_cache.recent_change_window_ms),
                max_entries: env_parse("LEADSYNC_CACHE_MAX_ENTRIES")
                    .unwrap_or(defaults_cache.max_entries),
            },
            retry: RetryPolicy {
                delays_ms: std::env::var("LEADSYNC_RETRY_DELAYS_MS")
                    .ok()
                    .and_then(|v| parse_delays(&v))
                    .unwrap_or(defaults_retry.delays_ms),
                expiry_ms: env_parse("LEADSYNC_FAILED_OP_EXPIRY_MS")
                    .unwrap_or(defaults_retry.expiry_ms),
            },
            lease_ttl_ms: env_parse("LEADSYNC_LEASE_TTL_MS").unwrap_or(DEFAULT_LEASE_TTL_MS),
            owner: std::env::var("LEADSYNC_OWNER").unwrap_or_else(|_| default_owner()),
            probe_interval_ms: env_parse("LEADSYNC_PROBE_INTERVAL_MS").unwrap_or(15_000),
            sweep_interval_ms: env_parse("LEADSYNC_SWEEP_INTERVAL_MS").unwrap_or(10_000),
        }
    }

    /// Defaults rooted at `dir` (for tests).
    pub fn for_tests(dir: &Path) -> Self {
        Self {
            data_dir: dir.to_path_buf(),
            store_prefix: DEFAULT_PREFIX.to_string(),
            max_snapshot_age_ms: DEFAULT_MAX_SNAPSHOT_AGE_MS,
            cache: CacheConfig::default(),
            retry: RetryPolicy::default(),
            lease_ttl_ms: DEFAULT_LEASE_TTL_MS,
            owner: "test-owner".to_string(),
            probe_interval_ms: 15_000,
            sweep_interval_ms: 10_000,
        }
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    pub fn failed_ops_dir(&self) -> PathBuf {
        self.data_dir.join("failed_ops")
    }
}
