use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Exact-match keys for the cached read views. Invalidation deletes keys, it
/// never patches values in place.
pub mod keys {
    use uuid::Uuid;

    pub fn catalog_all(kind: &str) -> String {
        format!("catalog:all:{kind}")
    }

    pub fn catalog_detail(entity_id: Uuid) -> String {
        format!("catalog:detail:{entity_id}")
    }

    pub fn guestlist(entity_id: Uuid) -> String {
        format!("guestlist:{entity_id}")
    }
}

/// Get/set/delete by exact key. The store is allowed to be unavailable: every
/// implementation degrades to a miss and the caller recomputes from the
/// database.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String, ttl: Duration);
    async fn del(&self, key: &str);
}

#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.manager.clone();
        match conn.get::<_, Option<String>>(key).await {
            Ok(value) => value,
            Err(err) => {
                warn!(key, error = %err, "cache read failed; treating as miss");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        let mut conn = self.manager.clone();
        let ttl_secs = ttl.as_secs().max(1);
        if let Err(err) = conn.set_ex::<_, _, ()>(key, value, ttl_secs).await {
            warn!(key, error = %err, "cache write failed");
        }
    }

    async fn del(&self, key: &str) {
        let mut conn = self.manager.clone();
        match conn.del::<_, ()>(key).await {
            Ok(()) => debug!(key, "cache invalidated"),
            Err(err) => warn!(key, error = %err, "cache invalidation failed"),
        }
    }
}

/// In-process TTL map used when no REDIS_URL is configured, and by tests.
/// Expired entries are dropped lazily on read.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some((value, deadline)) if *deadline > Instant::now() => {
                    return Some(value.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        self.entries.write().await.remove(key);
        None
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        let deadline = Instant::now() + ttl;
        self.entries
            .write()
            .await
            .insert(key.to_string(), (value, deadline));
    }

    async fn del(&self, key: &str) {
        self.entries.write().await.remove(key);
        debug!(key, "cache invalidated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn memory_cache_set_get_del() {
        let cache = MemoryCache::new();
        cache.set("k", "v".into(), Duration::from_secs(60)).await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
        cache.del("k").await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn memory_cache_expires_entries() {
        let cache = MemoryCache::new();
        cache.set("k", "v".into(), Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[test]
    fn keys_are_deterministic() {
        let id = Uuid::nil();
        assert_eq!(keys::catalog_all("event"), "catalog:all:event");
        assert_eq!(
            keys::catalog_detail(id),
            format!("catalog:detail:{id}")
        );
        assert_eq!(keys::guestlist(id), format!("guestlist:{id}"));
    }
}
