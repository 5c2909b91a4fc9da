//! TTL-aware string cache.
//!
//! The token chain only needs `get` and `set` with an expiry, so the store is
//! a small trait. [`MemoryCache`] backs the binary and the tests; a Redis
//! deployment plugs in its own implementation.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Cache backend failure.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("invalid ttl for key {key}: {ttl_seconds}s")]
    InvalidTtl { key: String, ttl_seconds: u64 },
}

/// String store with per-key expiry.
///
/// Implementations must never return a value whose TTL has lapsed.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), CacheError>;
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process cache. Entries are evicted lazily on read.
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remaining lifetime of a live key.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let entry = self.entries.get(key)?;
        entry.expires_at.checked_duration_since(Instant::now())
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Ok(Some(entry.value.clone()));
            }
        } else {
            return Ok(None);
        }

        self.entries.remove_if(key, |_, e| e.expires_at <= now);
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), CacheError> {
        // Zero, or too far out to represent as an Instant
        let expires_at = Some(ttl_seconds)
            .filter(|ttl| *ttl > 0)
            .and_then(|ttl| Instant::now().checked_add(Duration::from_secs(ttl)))
            .ok_or_else(|| CacheError::InvalidTtl {
                key: key.to_string(),
                ttl_seconds,
            })?;

        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let cache = MemoryCache::new();
        cache.set("k", "v", 60).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(cache.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_value_and_ttl() {
        let cache = MemoryCache::new();
        cache.set("k", "old", 60).await.unwrap();
        cache.set("k", "new", 7200).await.unwrap();

        assert_eq!(cache.get("k").await.unwrap(), Some("new".to_string()));
        assert!(cache.ttl("k").unwrap() > Duration::from_secs(7000));
    }

    #[tokio::test]
    async fn test_expired_entry_not_returned() {
        let cache = MemoryCache::new();
        cache.set("k", "v", 1).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_zero_ttl_rejected() {
        let cache = MemoryCache::new();
        let err = cache.set("k", "v", 0).await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidTtl { .. }));
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_rejected() {
        let cache = MemoryCache::new();
        let err = cache.set("k", "v", u64::MAX).await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::InvalidTtl {
                ttl_seconds: u64::MAX,
                ..
            }
        ));
        assert!(cache.is_empty());
    }
}
