//! Key/value token storage with per-key TTL.
//!
//! The token manager only depends on [`TokenCache`]; Redis backs it in
//! deployments and [`MemoryCache`] covers single-node runs and tests.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::types::UserId;

const ACCESS_TOKEN_PREFIX: &str = "oauth:access_token:";
const REFRESH_TOKEN_PREFIX: &str = "oauth:refresh_token:";

pub fn access_key(user_id: UserId) -> String {
    format!("{}{}", ACCESS_TOKEN_PREFIX, user_id)
}

pub fn refresh_key(user_id: UserId) -> String {
    format!("{}{}", REFRESH_TOKEN_PREFIX, user_id)
}

#[async_trait]
pub trait TokenCache: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

// Redis rejects EX 0, and a zero TTL would never be readable in memory either.
fn effective_ttl(ttl: Duration) -> Duration {
    ttl.max(Duration::from_secs(1))
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every expired entry, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        before - entries.len()
    }
}

#[async_trait]
impl TokenCache for MemoryCache {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let entry = CacheEntry {
            value: value.to_string(),
            expires_at: Instant::now() + effective_ttl(ttl),
        };
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Expired: evict under the write lock, re-checking in case it was just rewritten
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(CacheEntry::is_expired) {
            entries.remove(key);
            debug!("Evicted expired cache entry: {}", key);
        }
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[derive(Clone)]
pub struct RedisCache {
    connection: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| AppError::Cache(format!("Redis client error: {}", e)))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::Cache(format!("Connection failed: {}", e)))?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl TokenCache for RedisCache {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.set_ex::<_, _, ()>(key, value, effective_ttl(ttl).as_secs())
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_namespaces_are_per_user() {
        assert_eq!(access_key(7), "oauth:access_token:7");
        assert_eq!(refresh_key(7), "oauth:refresh_token:7");
        assert_ne!(access_key(1), access_key(11));
    }

    #[tokio::test]
    async fn memory_cache_set_get_delete() {
        let cache = MemoryCache::new();
        cache
            .set("k", "v", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert_eq!(cache.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_cache_entries_expire() {
        let cache = MemoryCache::new();
        cache
            .set("short", "v", Duration::from_secs(1))
            .await
            .unwrap();
        cache
            .set("long", "v", Duration::from_secs(600))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(cache.get("short").await.unwrap(), None);
        assert_eq!(cache.get("long").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn purge_drops_only_expired_entries() {
        let cache = MemoryCache::new();
        cache.set("a", "1", Duration::ZERO).await.unwrap();
        cache.set("b", "2", Duration::from_secs(600)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(cache.purge_expired().await, 1);
        assert_eq!(cache.get("b").await.unwrap().as_deref(), Some("2"));
    }
}
