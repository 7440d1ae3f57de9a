use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

/// Two-tier cache: in-memory DashMap (tier 1) with an optional Redis
/// tier 2. Redis is strictly optional: when `REDIS_URL` is unset every
/// operation degrades to the in-process tier and callers cannot tell the
/// difference apart from cross-replica visibility.
pub struct TieredCache {
    local: Arc<DashMap<String, String>>,
    redis: Option<ConnectionManager>,
}

impl TieredCache {
    pub fn new(redis: Option<ConnectionManager>) -> Self {
        Self {
            local: Arc::new(DashMap::new()),
            redis,
        }
    }

    pub fn redis(&self) -> Option<ConnectionManager> {
        self.redis.clone()
    }

    pub fn redis_available(&self) -> bool {
        self.redis.is_some()
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        // tier 1: in-memory
        if let Some(entry) = self.local.get(key) {
            return serde_json::from_str(entry.value()).ok();
        }

        // tier 2: redis
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            if let Ok(Some(v)) = conn.get::<_, Option<String>>(key).await {
                self.local.insert(key.to_string(), v.clone());
                return serde_json::from_str(&v).ok();
            }
        }

        None
    }

    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: u64,
    ) -> anyhow::Result<()> {
        let json = serde_json::to_string(value)?;
        self.local.insert(key.to_string(), json.clone());

        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            conn.set_ex::<_, _, ()>(key, json, ttl_secs).await?;
        }
        Ok(())
    }

    pub fn invalidate_local(&self, key: &str) {
        self.local.remove(key);
    }

    /// Atomic INCR + EXPIRE on a window-bucketed key. Returns `None`
    /// when Redis is unavailable so callers can fall back in-process.
    pub async fn increment(&self, key: &str, window_secs: u64) -> Option<u64> {
        let redis = self.redis.as_ref()?;
        let mut conn = redis.clone();
        let script = redis::Script::new(
            r#"
            local current = redis.call("INCR", KEYS[1])
            if current == 1 then
                redis.call("EXPIRE", KEYS[1], ARGV[1])
            end
            return current
        "#,
        );
        match script
            .key(key)
            .arg(window_secs)
            .invoke_async::<_, u64>(&mut conn)
            .await
        {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::warn!("redis increment failed, falling back in-process: {}", e);
                None
            }
        }
    }

    /// Best-effort pub/sub publish. Failures are logged and ignored;
    /// the in-process consumer is the source of truth.
    pub async fn publish(&self, channel: &str, payload: &str) {
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            if let Err(e) = conn.publish::<_, _, ()>(channel, payload).await {
                tracing::warn!(channel = channel, "pub/sub mirror publish failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_tier_roundtrip_without_redis() {
        let cache = TieredCache::new(None);
        cache.set("k", &vec![1u32, 2, 3], 60).await.unwrap();
        let got: Option<Vec<u32>> = cache.get("k").await;
        assert_eq!(got, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_increment_without_redis_returns_none() {
        let cache = TieredCache::new(None);
        assert!(cache.increment("rl:user", 60).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_local() {
        let cache = TieredCache::new(None);
        cache.set("k", &"v".to_string(), 60).await.unwrap();
        cache.invalidate_local("k");
        let got: Option<String> = cache.get("k").await;
        assert!(got.is_none());
    }
}
