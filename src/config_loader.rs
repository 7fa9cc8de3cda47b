//! Cached, tenant-scoped configuration loading.
//!
//! Thin TTL cache over the [`ConfigStore`] contract. Three keyed caches:
//! secretaries (by extension and by id), provider credentials, and
//! transfer rules. Misses fetch outside the lock and install briefly;
//! entries expire after the TTL and the oldest are evicted once a cache
//! passes its size cap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::store::{
    ConfigStore, ProviderCredentials, SecretaryRecord, StoreResult, TransferRule,
};

/// Default entry lifetime.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Default per-cache size cap.
pub const DEFAULT_MAX_CACHE_SIZE: usize = 1000;

struct CacheEntry<T> {
    data: T,
    created_at: Instant,
    ttl: Duration,
}

impl<T> CacheEntry<T> {
    fn new(data: T, ttl: Duration) -> Self {
        Self {
            data,
            created_at: Instant::now(),
            ttl,
        }
    }

    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

struct Cache<T> {
    entries: Mutex<HashMap<String, CacheEntry<T>>>,
}

impl<T: Clone> Cache<T> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, key: &str) -> Option<T> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if !entry.is_expired() => Some(entry.data.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn insert(&self, key: String, data: T, ttl: Duration, max_size: usize) {
        let mut entries = self.entries.lock();
        entries.insert(key, CacheEntry::new(data, ttl));

        // Drop expired entries, then the oldest beyond the cap.
        entries.retain(|_, e| !e.is_expired());
        if entries.len() > max_size {
            let mut by_age: Vec<(String, Instant)> = entries
                .iter()
                .map(|(k, e)| (k.clone(), e.created_at))
                .collect();
            by_age.sort_by_key(|(_, created)| *created);
            let excess = entries.len() - max_size;
            for (key, _) in by_age.into_iter().take(excess) {
                entries.remove(&key);
            }
        }
    }

    fn invalidate(&self, domain_id: Option<&str>) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        match domain_id {
            Some(domain) => entries.retain(|k, _| !k.contains(domain)),
            None => entries.clear(),
        }
        before - entries.len()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Which cache kind an invalidation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Secretary,
    Provider,
    TransferRules,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub secretary_entries: usize,
    pub provider_entries: usize,
    pub transfer_rule_entries: usize,
    pub max_cache_size: usize,
    pub ttl_seconds: u64,
}

pub struct ConfigLoader {
    store: Arc<dyn ConfigStore>,
    ttl: Duration,
    max_size: usize,
    secretaries: Cache<Option<SecretaryRecord>>,
    providers: Cache<Option<ProviderCredentials>>,
    rules: Cache<Vec<TransferRule>>,
}

impl ConfigLoader {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self::with_limits(store, DEFAULT_CACHE_TTL, DEFAULT_MAX_CACHE_SIZE)
    }

    pub fn with_limits(store: Arc<dyn ConfigStore>, ttl: Duration, max_size: usize) -> Self {
        Self {
            store,
            ttl,
            max_size,
            secretaries: Cache::new(),
            providers: Cache::new(),
            rules: Cache::new(),
        }
    }

    fn cache_key(parts: &[&str]) -> String {
        parts.join(":")
    }

    pub async fn secretary_by_extension(
        &self,
        domain_id: &str,
        extension: &str,
    ) -> StoreResult<Option<SecretaryRecord>> {
        let key = Self::cache_key(&["secretary", domain_id, extension]);
        if let Some(hit) = self.secretaries.get(&key) {
            tracing::debug!(key = %key, "config cache hit");
            return Ok(hit);
        }
        let fetched = self.store.secretary_by_extension(domain_id, extension).await?;
        self.secretaries
            .insert(key, fetched.clone(), self.ttl, self.max_size);
        Ok(fetched)
    }

    pub async fn secretary_by_id(
        &self,
        domain_id: &str,
        secretary_id: &str,
    ) -> StoreResult<Option<SecretaryRecord>> {
        let key = Self::cache_key(&["secretary_id", domain_id, secretary_id]);
        if let Some(hit) = self.secretaries.get(&key) {
            return Ok(hit);
        }
        let fetched = self.store.secretary_by_id(domain_id, secretary_id).await?;
        self.secretaries
            .insert(key, fetched.clone(), self.ttl, self.max_size);
        Ok(fetched)
    }

    /// Realtime-capable secretary answering this tenant's calls.
    pub async fn default_secretary(
        &self,
        domain_id: &str,
    ) -> StoreResult<Option<SecretaryRecord>> {
        let key = Self::cache_key(&["secretary_default", domain_id]);
        if let Some(hit) = self.secretaries.get(&key) {
            return Ok(hit);
        }
        let fetched = self.store.default_secretary(domain_id).await?;
        self.secretaries
            .insert(key, fetched.clone(), self.ttl, self.max_size);
        Ok(fetched)
    }

    pub async fn provider_credentials(
        &self,
        domain_id: &str,
        provider_type: &str,
        provider_name: Option<&str>,
    ) -> StoreResult<Option<ProviderCredentials>> {
        let key = Self::cache_key(&[
            "provider",
            domain_id,
            provider_type,
            provider_name.unwrap_or("default"),
        ]);
        if let Some(hit) = self.providers.get(&key) {
            return Ok(hit);
        }
        let fetched = self
            .store
            .provider_credentials(domain_id, provider_type, provider_name)
            .await?;
        self.providers
            .insert(key, fetched.clone(), self.ttl, self.max_size);
        Ok(fetched)
    }

    /// Secretary-specific plus tenant-global rules, ordered by
    /// (priority asc, department name asc). Empty result sets are cached
    /// too, so a tenant without rules does not re-query every turn.
    pub async fn transfer_rules(
        &self,
        domain_id: &str,
        secretary_id: Option<&str>,
    ) -> StoreResult<Vec<TransferRule>> {
        let key = Self::cache_key(&[
            "transfer_rules",
            domain_id,
            secretary_id.unwrap_or("global"),
        ]);
        if let Some(hit) = self.rules.get(&key) {
            tracing::debug!(key = %key, "transfer rules cache hit");
            return Ok(hit);
        }
        let fetched = self.store.transfer_rules(domain_id, secretary_id).await?;
        tracing::info!(
            domain = domain_id,
            secretary = ?secretary_id,
            count = fetched.len(),
            "transfer rules loaded"
        );
        self.rules
            .insert(key, fetched.clone(), self.ttl, self.max_size);
        Ok(fetched)
    }

    /// Drop cached entries, optionally scoped by tenant and cache kind.
    /// Returns the number of entries removed.
    pub fn invalidate(&self, domain_id: Option<&str>, kind: Option<CacheKind>) -> usize {
        let mut removed = 0;
        if matches!(kind, None | Some(CacheKind::Secretary)) {
            removed += self.secretaries.invalidate(domain_id);
        }
        if matches!(kind, None | Some(CacheKind::Provider)) {
            removed += self.providers.invalidate(domain_id);
        }
        if matches!(kind, None | Some(CacheKind::TransferRules)) {
            removed += self.rules.invalidate(domain_id);
        }
        tracing::info!(removed, domain = ?domain_id, "config cache invalidated");
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            secretary_entries: self.secretaries.len(),
            provider_entries: self.providers.len(),
            transfer_rule_entries: self.rules.len(),
            max_cache_size: self.max_size,
            ttl_seconds: self.ttl.as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn secretary(domain: &str, ext: &str) -> SecretaryRecord {
        SecretaryRecord {
            secretary_id: format!("sec-{ext}"),
            domain_id: domain.into(),
            extension: ext.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn second_read_hits_cache() {
        let store = Arc::new(MemoryStore::new());
        store.insert_secretary(secretary("t1", "100"));
        let loader = ConfigLoader::new(store.clone());

        let first = loader.secretary_by_extension("t1", "100").await.unwrap();
        assert!(first.is_some());
        let second = loader.secretary_by_extension("t1", "100").await.unwrap();
        assert!(second.is_some());
        assert_eq!(store.fetch_count("secretary:t1:100"), 1);
    }

    #[tokio::test]
    async fn expired_entries_refetch() {
        let store = Arc::new(MemoryStore::new());
        store.insert_secretary(secretary("t1", "100"));
        let loader =
            ConfigLoader::with_limits(store.clone(), Duration::from_millis(0), 100);

        loader.secretary_by_extension("t1", "100").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        loader.secretary_by_extension("t1", "100").await.unwrap();
        assert_eq!(store.fetch_count("secretary:t1:100"), 2);
    }

    #[tokio::test]
    async fn invalidate_by_domain_and_kind() {
        let store = Arc::new(MemoryStore::new());
        store.insert_secretary(secretary("t1", "100"));
        store.insert_secretary(secretary("t2", "200"));
        let loader = ConfigLoader::new(store.clone());

        loader.secretary_by_extension("t1", "100").await.unwrap();
        loader.secretary_by_extension("t2", "200").await.unwrap();
        loader.transfer_rules("t1", None).await.unwrap();

        let removed = loader.invalidate(Some("t1"), Some(CacheKind::Secretary));
        assert_eq!(removed, 1);

        // t2 entry survives; t1 refetches.
        loader.secretary_by_extension("t2", "200").await.unwrap();
        assert_eq!(store.fetch_count("secretary:t2:200"), 1);
        loader.secretary_by_extension("t1", "100").await.unwrap();
        assert_eq!(store.fetch_count("secretary:t1:100"), 2);

        // Rules cache untouched by the secretary-kind invalidation.
        loader.transfer_rules("t1", None).await.unwrap();
        assert_eq!(store.fetch_count("rules:t1:global"), 1);
    }

    #[tokio::test]
    async fn size_cap_evicts_oldest() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..5 {
            store.insert_secretary(secretary("t1", &format!("{i}")));
        }
        let loader = ConfigLoader::with_limits(store.clone(), Duration::from_secs(300), 3);

        for i in 0..5 {
            loader
                .secretary_by_extension("t1", &format!("{i}"))
                .await
                .unwrap();
            // Keep insertion order observable.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(loader.stats().secretary_entries <= 3);
    }

    #[tokio::test]
    async fn empty_rule_sets_are_cached() {
        let store = Arc::new(MemoryStore::new());
        let loader = ConfigLoader::new(store.clone());

        assert!(loader.transfer_rules("t1", Some("s1")).await.unwrap().is_empty());
        assert!(loader.transfer_rules("t1", Some("s1")).await.unwrap().is_empty());
        assert_eq!(store.fetch_count("rules:t1:s1"), 1);
    }

    #[tokio::test]
    async fn stats_report_configured_limits() {
        let store = Arc::new(MemoryStore::new());
        let loader = ConfigLoader::with_limits(store, Duration::from_secs(60), 42);
        let stats = loader.stats();
        assert_eq!(stats.max_cache_size, 42);
        assert_eq!(stats.ttl_seconds, 60);
        assert_eq!(stats.secretary_entries, 0);
    }
}
