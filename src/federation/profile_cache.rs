//! Remote profile caching
//!
//! Caches fetched actor documents to reduce remote requests. Entries
//! are keyed by the URL they were fetched from.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::webfinger::RemoteProfile;
use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};

const CACHE_NAME: &str = "remote_profile";

/// Cached profile entry
#[derive(Debug, Clone)]
struct CachedProfile {
    profile: RemoteProfile,
    /// When this entry was cached
    cached_at: Instant,
}

/// Profile cache
///
/// Thread-safe TTL cache for remote actor profiles.
pub struct ProfileCache {
    /// Cache storage: url -> cached profile
    cache: RwLock<HashMap<String, CachedProfile>>,
    ttl: Duration,
}

impl ProfileCache {
    /// Create new profile cache
    ///
    /// # Arguments
    /// * `ttl` - How long a fetched profile is reused
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Get a cached profile if present and not expired
    pub async fn get(&self, url: &str) -> Option<RemoteProfile> {
        let cache = self.cache.read().await;
        match cache.get(url) {
            Some(cached) if cached.cached_at.elapsed() < self.ttl => {
                tracing::debug!(url = %url, "Profile cache hit");
                CACHE_HITS_TOTAL.with_label_values(&[CACHE_NAME]).inc();
                Some(cached.profile.clone())
            }
            _ => {
                CACHE_MISSES_TOTAL.with_label_values(&[CACHE_NAME]).inc();
                None
            }
        }
    }

    /// Store a profile under the URL it was fetched from and its canonical id
    pub async fn insert(&self, url: &str, profile: &RemoteProfile) {
        let mut cache = self.cache.write().await;
        let entry = CachedProfile {
            profile: profile.clone(),
            cached_at: Instant::now(),
        };
        if profile.id != url {
            cache.insert(profile.id.clone(), entry.clone());
        }
        cache.insert(url.to_string(), entry);
    }

    /// Invalidate a cached profile
    ///
    /// Useful when a key is known to be invalid or changed.
    pub async fn invalidate(&self, url: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(url);
        tracing::debug!(url = %url, "Invalidated profile cache entry");
    }

    /// Prune expired entries
    pub async fn prune_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        let ttl = self.ttl;
        cache.retain(|_, v| v.cached_at.elapsed() < ttl);
        let removed = before - cache.len();

        if removed > 0 {
            tracing::info!("Pruned {} expired profile cache entries", removed);
        }
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str) -> RemoteProfile {
        RemoteProfile {
            id: id.to_string(),
            kind: "Person".to_string(),
            preferred_username: Some("alice".to_string()),
            name: None,
            inbox: Some(format!("{id}/inbox")),
            shared_inbox: None,
            public_key_id: None,
            public_key_pem: None,
            icon_url: None,
        }
    }

    #[tokio::test]
    async fn test_cache_expiry() {
        let cache = ProfileCache::new(Duration::from_millis(100));
        cache
            .insert(
                "https://remote.example/@alice",
                &profile("https://remote.example/users/alice"),
            )
            .await;

        // Reachable by fetch URL and canonical id
        assert!(cache.get("https://remote.example/@alice").await.is_some());
        assert!(cache.get("https://remote.example/users/alice").await.is_some());

        // Wait for expiry
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.get("https://remote.example/users/alice").await.is_none());

        // Prune should remove both entries
        cache.prune_expired().await;
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache = ProfileCache::new(Duration::from_secs(60));
        let id = "https://remote.example/users/alice";
        cache.insert(id, &profile(id)).await;
        cache.invalidate(id).await;
        assert!(cache.get(id).await.is_none());
    }
}
