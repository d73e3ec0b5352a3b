//! In-memory staleness cache for webhook reads.
//!
//! Entries are keyed by `operation:payload-hash`. Staleness is dynamic: an
//! entry is fresh for [`CacheConfig::default_ttl_ms`] normally, but only for
//! [`CacheConfig::recent_change_ttl_ms`] while a mutation happened within
//! the last [`CacheConfig::recent_change_window_ms`]. Nothing is invalidated
//! automatically beyond that; callers delete by key or regex pattern.

use crate::clock::SharedClock;
use crate::error::Result;
use dashmap::DashMap;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl_ms: u64,
    pub recent_change_ttl_ms: u64,
    pub recent_change_window_ms: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 2 * 60 * 1000,
            recent_change_ttl_ms: 10 * 1000,
            recent_change_window_ms: 60 * 1000,
            max_entries: 500,
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    stored_at_ms: u64,
    data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub last_change_ms: Option<u64>,
}

pub struct CacheManager {
    entries: DashMap<String, Arc<CacheEntry>>,
    config: CacheConfig,
    clock: SharedClock,
    last_change_ms: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    cap: AtomicUsize,
}

/// Build the cache key for an operation and its payload.
///
/// The payload is hashed from its serialized form. `serde_json` keeps
/// object keys in insertion order, so callers must build payloads
/// consistently for keys to match.
pub fn cache_key(operation: &str, payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}:{}", operation, &digest[..16])
}

impl CacheManager {
    pub fn new(config: CacheConfig, clock: SharedClock) -> Self {
        let cap = config.max_entries;
        Self {
            entries: DashMap::new(),
            config,
            clock,
            last_change_ms: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            cap: AtomicUsize::new(cap),
        }
    }

    /// Age limit currently in force.
    pub fn current_ttl_ms(&self) -> u64 {
        let last_change = self.last_change_ms.load(Ordering::Relaxed);
        let now = self.clock.now_ms();
        if last_change > 0 && now.saturating_sub(last_change) < self.config.recent_change_window_ms
        {
            self.config.recent_change_ttl_ms
        } else {
            self.config.default_ttl_ms
        }
    }

    /// Fresh data for `key`, or `None` when missing or stale.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let ttl = self.current_ttl_ms();
        let now = self.clock.now_ms();
        match self.entries.get(key) {
            Some(entry) => {
                let age = now.saturating_sub(entry.stored_at_ms);
                if age < ttl {
                    tracing::debug!("[CACHE] HIT {} ({}ms old)", key, age);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Some(entry.data.clone())
                } else {
                    tracing::debug!("[CACHE] STALE {} ({}ms old, ttl {}ms)", key, age, ttl);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Cached data regardless of age, with its age in milliseconds.
    /// Used as a last resort when the backend is unreachable.
    pub fn get_stale(&self, key: &str) -> Option<(serde_json::Value, u64)> {
        let now = self.clock.now_ms();
        self.entries
            .get(key)
            .map(|e| (e.data.clone(), now.saturating_sub(e.stored_at_ms)))
    }

    pub fn set(&self, key: impl Into<String>, data: serde_json::Value) {
        let key = key.into();
        if !self.entries.contains_key(&key)
            && self.entries.len() >= self.cap.load(Ordering::Relaxed)
        {
            self.evict_oldest();
        }
        self.entries.insert(
            key,
            Arc::new(CacheEntry {
                stored_at_ms: self.clock.now_ms(),
                data,
            }),
        );
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.stored_at_ms)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
            tracing::debug!("[CACHE] evicted {}", key);
        }
    }

    /// Record that a mutation just happened. Opens the recent-change window
    /// and shortens the TTL for every entry.
    pub fn mark_changed(&self) {
        self.last_change_ms
            .store(self.clock.now_ms(), Ordering::Relaxed);
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every entry whose key matches `pattern`. Returns the number
    /// of entries removed.
    pub fn invalidate_pattern(&self, pattern: &str) -> Result<usize> {
        let re = Regex::new(pattern)?;
        let before = self.entries.len();
        self.entries.retain(|k, _| !re.is_match(k));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!("[CACHE] invalidated {} entries matching {}", removed, pattern);
        }
        Ok(removed)
    }

    /// Drop all entries cached for an operation prefix (e.g. `getLeads`).
    pub fn invalidate_operation(&self, operation: &str) -> usize {
        let prefix = format!("{}:", operation);
        let before = self.entries.len();
        self.entries.retain(|k, _| !k.starts_with(&prefix));
        before.saturating_sub(self.entries.len())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn stats(&self) -> CacheStats {
        let last = self.last_change_ms.load(Ordering::Relaxed);
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            last_change_ms: if last > 0 { Some(last) } else { None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn cache_at(start: u64) -> (CacheManager, Arc<ManualClock>) {
        let clock = ManualClock::new(start);
        (
            CacheManager::new(CacheConfig::default(), clock.clone()),
            clock,
        )
    }

    #[test]
    fn test_fresh_for_two_minutes_without_changes() {
        let (cache, clock) = cache_at(1_000_000);
        cache.set("getLeads:abc", json!([1, 2]));

        clock.advance_ms(119_000);
        assert_eq!(cache.get("getLeads:abc"), Some(json!([1, 2])));

        clock.advance_ms(1_000);
        assert_eq!(cache.get("getLeads:abc"), None);
        // Still reachable as a stale fallback
        let (data, age) = cache.get_stale("getLeads:abc").unwrap();
        assert_eq!(data, json!([1, 2]));
        assert_eq!(age, 120_000);
    }

    #[test]
    fn test_recent_change_shortens_ttl_to_ten_seconds() {
        let (cache, clock) = cache_at(1_000_000);
        cache.set("getLeads:abc", json!([]));
        cache.mark_changed();
        assert_eq!(cache.current_ttl_ms(), 10_000);

        clock.advance_ms(9_999);
        assert!(cache.get("getLeads:abc").is_some());
        clock.advance_ms(1);
        assert!(cache.get("getLeads:abc").is_none());
    }

    #[test]
    fn test_change_window_closes_after_one_minute() {
        let (cache, clock) = cache_at(1_000_000);
        cache.mark_changed();
        clock.advance_ms(59_999);
        assert_eq!(cache.current_ttl_ms(), 10_000);
        clock.advance_ms(1);
        assert_eq!(cache.current_ttl_ms(), 120_000);
    }

    #[test]
    fn test_invalidate_pattern_matches_regex_over_keys() {
        let (cache, _) = cache_at(1);
        cache.set("getLeads:1", json!(1));
        cache.set("getLeads:2", json!(2));
        cache.set("getAgents:1", json!(3));

        assert_eq!(cache.invalidate_pattern("^getLeads:").unwrap(), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.invalidate_pattern("(unclosed").is_err());
    }

    #[test]
    fn test_cache_key_depends_on_payload() {
        let a = cache_key("generateMessage", &json!({"leadId": "1"}));
        let b = cache_key("generateMessage", &json!({"leadId": "2"}));
        assert_ne!(a, b);
        assert!(a.starts_with("generateMessage:"));
        assert_eq!(a, cache_key("generateMessage", &json!({"leadId": "1"})));
    }

    #[test]
    fn test_cap_evicts_oldest() {
        let clock = ManualClock::new(10);
        let cache = CacheManager::new(
            CacheConfig {
                max_entries: 2,
                ..Default::default()
            },
            clock.clone(),
        );
        cache.set("a", json!(1));
        clock.advance_ms(1);
        cache.set("b", json!(2));
        clock.advance_ms(1);
        cache.set("c", json!(3));
        assert_eq!(cache.len(), 2);
        assert!(cache.get_stale("a").is_none());
        assert!(cache.get_stale("c").is_some());
    }

    #[test]
    fn test_stats_count_hits_and_misses() {
        let (cache, _) = cache_at(5);
        cache.set("k", json!(true));
        cache.get("k");
        cache.get("missing");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert!(stats.last_change_ms.is_none());
    }
}
