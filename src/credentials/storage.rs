//! Dual-write credential storage on top of a [`CacheStore`].

use super::Credential;
use crate::cache::{CacheError, CacheStore};
use crate::keys::CacheKeySet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Credential storage with compatibility keys.
///
/// # Reads
/// Keys are tried in [`CacheKeySet::read_order`]; the first hit wins.
///
/// # Writes
/// Every key of the set is written with the same TTL. The first failing
/// write is returned: a lost compat key only costs a future fallback miss,
/// a lost primary key costs a remote refetch, and callers decide whether
/// either is worth a retry.
#[derive(Clone)]
pub struct CredentialStore {
    cache: Arc<dyn CacheStore>,
}

impl CredentialStore {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    /// Returns the first live value found under `keys`.
    pub async fn get(&self, keys: &CacheKeySet) -> Result<Option<String>, CacheError> {
        for key in keys.read_order() {
            if let Some(value) = self.cache.get(key).await? {
                if value.is_empty() {
                    continue;
                }
                if key != keys.primary {
                    debug!(key = %key, primary = %keys.primary, "Credential served from fallback key");
                }
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Writes `value` under every key of `keys`.
    pub async fn set(
        &self,
        keys: &CacheKeySet,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<(), CacheError> {
        let mut first_error = None;

        for key in keys.write_keys() {
            if let Err(e) = self.cache.set(key, value, ttl_seconds).await {
                warn!(key = %key, error = %e, "Failed to write credential key");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Writes a [`Credential`] using its own TTL.
    pub async fn put(&self, keys: &CacheKeySet, credential: &Credential) -> Result<(), CacheError> {
        debug!(
            kind = ?credential.kind,
            owner = %credential.owner_id,
            ttl_seconds = credential.ttl_seconds,
            expires_at = %credential.expires_at(),
            "Caching credential"
        );
        self.set(keys, &credential.value, credential.ttl_seconds).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::credentials::CredentialKind;
    use crate::keys::{key_set, KeyStrategy, ResourceKind};
    use async_trait::async_trait;

    fn create_test_store() -> (CredentialStore, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        (CredentialStore::new(cache.clone()), cache)
    }

    /// Cache that refuses writes to one key.
    struct FailingKeyCache {
        inner: MemoryCache,
        failing_key: String,
    }

    #[async_trait]
    impl CacheStore for FailingKeyCache {
        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: u64) -> Result<(), CacheError> {
            if key == self.failing_key {
                return Err(CacheError::Unavailable("write refused".to_string()));
            }
            self.inner.set(key, value, ttl).await
        }
    }

    #[tokio::test]
    async fn test_write_then_read_with_other_strategy() {
        let kinds = [
            ResourceKind::VerifyTicket,
            ResourceKind::ComponentToken,
            ResourceKind::PreAuthCode,
            ResourceKind::AuthorizerToken,
        ];

        for strategy in [KeyStrategy::Scoped, KeyStrategy::Legacy] {
            for kind in kinds {
                let (store, _) = create_test_store();
                let writer = key_set(strategy, "wx1", kind);
                store.set(&writer, "value-1", 120).await.unwrap();

                let reader = key_set(strategy.other(), "wx1", kind);
                assert_eq!(
                    store.get(&reader).await.unwrap(),
                    Some("value-1".to_string()),
                    "{:?}/{:?}",
                    strategy,
                    kind
                );
            }
        }
    }

    #[tokio::test]
    async fn test_fallback_reads_compat_when_primary_missing() {
        let (store, cache) = create_test_store();
        let keys = key_set(KeyStrategy::Scoped, "wx1", ResourceKind::ComponentToken);

        cache.set(&keys.compat, "from-compat", 120).await.unwrap();
        assert_eq!(store.get(&keys).await.unwrap(), Some("from-compat".to_string()));

        cache.set(&keys.primary, "from-primary", 120).await.unwrap();
        assert_eq!(store.get(&keys).await.unwrap(), Some("from-primary".to_string()));
    }

    #[tokio::test]
    async fn test_ticket_alias_is_written_and_read() {
        let (store, cache) = create_test_store();
        let keys = key_set(KeyStrategy::Scoped, "wx1", ResourceKind::VerifyTicket);

        store.set(&keys, "ticket", 43200).await.unwrap();
        assert_eq!(
            cache.get(crate::keys::LEGACY_TICKET_ALIAS).await.unwrap(),
            Some("ticket".to_string())
        );

        let (store, cache) = create_test_store();
        cache
            .set(crate::keys::LEGACY_TICKET_ALIAS, "old-ticket", 60)
            .await
            .unwrap();
        assert_eq!(store.get(&keys).await.unwrap(), Some("old-ticket".to_string()));
    }

    #[tokio::test]
    async fn test_set_uses_same_ttl_for_all_keys() {
        let (store, cache) = create_test_store();
        let keys = key_set(KeyStrategy::Legacy, "wxabc", ResourceKind::AuthorizerToken);

        store.set(&keys, "tok", 6900).await.unwrap();

        for key in keys.write_keys() {
            let ttl = cache.ttl(key).unwrap().as_secs();
            assert!((6898..=6900).contains(&ttl), "{} ttl {}", key, ttl);
        }
    }

    #[tokio::test]
    async fn test_compat_write_failure_is_surfaced() {
        let keys = key_set(KeyStrategy::Scoped, "wx1", ResourceKind::PreAuthCode);
        let cache = Arc::new(FailingKeyCache {
            inner: MemoryCache::new(),
            failing_key: keys.compat.clone(),
        });
        let store = CredentialStore::new(cache.clone());

        let result = store.set(&keys, "code", 570).await;
        assert!(result.is_err());

        // Primary still landed
        assert_eq!(cache.inner.get(&keys.primary).await.unwrap(), Some("code".to_string()));
    }

    #[tokio::test]
    async fn test_put_credential() {
        let (store, _) = create_test_store();
        let keys = key_set(KeyStrategy::Scoped, "wx1", ResourceKind::ComponentToken);
        let cred = Credential::new(CredentialKind::ComponentToken, "wx1", "tok", 6900);

        store.put(&keys, &cred).await.unwrap();
        assert_eq!(store.get(&keys).await.unwrap(), Some("tok".to_string()));
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let (store, _) = create_test_store();
        let keys = key_set(KeyStrategy::Scoped, "wx1", ResourceKind::PreAuthCode);
        assert!(store.get(&keys).await.unwrap().is_none());
    }
}
