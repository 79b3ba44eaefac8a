//! Fleet-wide device coordination over a shared redis store.
//!
//! Each user's online IPs live in a redis set keyed by the user's panel
//! email, with a TTL so departed devices age out. A read-through memory
//! cache fronts the store; peers announce set updates on a pub/sub channel
//! so the cache entries are invalidated instead of waiting out their TTL.
//!
//! Store failures degrade to local-only enforcement: the connection is
//! never denied on the strength of an unreachable store.

use dashmap::DashMap;
use futures_util::StreamExt;
use nc_config::GlobalDeviceLimitConfig;
use redis::AsyncCommands;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

const UPDATE_CHANNEL: &str = "updatekey";
const CACHE_CLEAN_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct CacheItem {
    ips: HashSet<String>,
    expire: Instant,
}

impl CacheItem {
    fn outdated(&self) -> bool {
        Instant::now() > self.expire
    }
}

/// Expiring mirror of the store's online-IP sets.
#[derive(Debug, Default)]
struct MemCache {
    items: DashMap<String, CacheItem>,
}

impl MemCache {
    fn get(&self, key: &str) -> Option<CacheItem> {
        let item = self.items.get(key)?;
        if item.outdated() {
            return None;
        }
        Some(item.clone())
    }

    fn set(&self, key: &str, item: CacheItem) {
        self.items.insert(key.to_string(), item);
    }

    fn delete(&self, key: &str) {
        self.items.remove(key);
    }

    fn sweep(&self) {
        self.items.retain(|_, item| !item.outdated());
    }
}

pub struct GlobalLimiter {
    client: redis::Client,
    conn: tokio::sync::Mutex<Option<redis::aio::MultiplexedConnection>>,
    cache: MemCache,
    timeout: Duration,
    expiry: Duration,
}

impl GlobalLimiter {
    pub fn new(config: &GlobalDeviceLimitConfig) -> anyhow::Result<Arc<Self>> {
        let url = if config.redis_password.is_empty() {
            format!("redis://{}/{}", config.redis_addr, config.redis_db)
        } else {
            format!(
                "redis://:{}@{}/{}",
                config.redis_password, config.redis_addr, config.redis_db
            )
        };
        let client = redis::Client::open(url)?;
        let limiter = Arc::new(Self {
            client,
            conn: tokio::sync::Mutex::new(None),
            cache: MemCache::default(),
            timeout: Duration::from_secs(config.timeout.max(1)),
            expiry: Duration::from_secs(config.expiry.max(1)),
        });
        limiter.spawn_janitor();
        limiter.spawn_subscriber();
        Ok(limiter)
    }

    /// Decide whether `ip` may come online for `email`.
    ///
    /// Returns `true` to reject. Store errors log and admit (local policy
    /// already passed).
    pub async fn check(&self, email: &str, ip: &str, device_limit: i32) -> bool {
        let online = match self.cached_set(email).await {
            Ok(online) => online,
            Err(err) => {
                tracing::warn!(email, %err, "global limit store unreachable, local-only");
                return false;
            }
        };
        match online {
            None => {
                // First device anywhere in the fleet.
                if let Err(err) = self.new_ip(email, ip).await {
                    tracing::warn!(email, %err, "global limit store write failed");
                }
                false
            }
            Some(online) if online.contains(ip) => false,
            Some(online) if (online.len() as i32) < device_limit => {
                if let Err(err) = self.push_ip(email, ip, device_limit).await {
                    tracing::warn!(email, %err, "global limit store write failed");
                }
                false
            }
            Some(_) => true,
        }
    }

    /// Cache hit, or read-through to the store. `Ok(None)` means the user
    /// has no online set anywhere.
    async fn cached_set(&self, email: &str) -> anyhow::Result<Option<HashSet<String>>> {
        if let Some(item) = self.cache.get(email) {
            return Ok(Some(item.ips));
        }
        self.sync_from_store(email).await
    }

    async fn sync_from_store(&self, key: &str) -> anyhow::Result<Option<HashSet<String>>> {
        let mut conn = self.connection().await?;
        let exists: bool = self
            .with_timeout(conn.exists(key))
            .await??;
        if !exists {
            return Ok(None);
        }
        let ips: Vec<String> = self.with_timeout(conn.smembers(key)).await??;
        let ttl: i64 = self.with_timeout(conn.ttl(key)).await??;
        let ttl = if ttl > 0 {
            Duration::from_secs(ttl as u64)
        } else {
            self.expiry
        };
        let set: HashSet<String> = ips.into_iter().collect();
        self.cache.set(
            key,
            CacheItem {
                ips: set.clone(),
                expire: Instant::now() + ttl,
            },
        );
        Ok(Some(set))
    }

    async fn new_ip(&self, email: &str, ip: &str) -> anyhow::Result<()> {
        let mut conn = self.connection().await?;
        self.with_timeout(conn.sadd::<_, _, ()>(email, ip)).await??;
        self.with_timeout(conn.expire::<_, ()>(email, self.expiry.as_secs() as i64))
            .await??;
        Ok(())
    }

    async fn push_ip(&self, email: &str, ip: &str, device_limit: i32) -> anyhow::Result<()> {
        let mut conn = self.connection().await?;
        // Re-check under the store's view: another node may have filled the
        // last slot since our cache was refreshed.
        let card: i64 = self.with_timeout(conn.scard(email)).await??;
        if card >= device_limit as i64 {
            return Ok(());
        }
        self.with_timeout(conn.sadd::<_, _, ()>(email, ip)).await??;
        let ttl: i64 = self.with_timeout(conn.ttl(email)).await??;
        if ttl == -1 {
            self.with_timeout(conn.expire::<_, ()>(email, self.expiry.as_secs() as i64))
                .await??;
        }
        // Ask the other nodes to drop their cached copy of this set.
        self.with_timeout(conn.publish::<_, _, ()>(UPDATE_CHANNEL, email))
            .await??;
        Ok(())
    }

    async fn connection(&self) -> anyhow::Result<redis::aio::MultiplexedConnection> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .with_timeout(self.client.get_multiplexed_tokio_connection())
            .await??;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn with_timeout<F, T>(&self, fut: F) -> anyhow::Result<T>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| anyhow::anyhow!("store call timed out after {:?}", self.timeout))
    }

    fn spawn_janitor(self: &Arc<Self>) {
        let this = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(CACHE_CLEAN_INTERVAL);
            loop {
                tick.tick().await;
                let Some(this) = this.upgrade() else { return };
                this.cache.sweep();
            }
        });
    }

    fn spawn_subscriber(self: &Arc<Self>) {
        let this = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let Some(limiter) = this.upgrade() else { return };
                let client = limiter.client.clone();
                drop(limiter);
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(err) = pubsub.subscribe(UPDATE_CHANNEL).await {
                            tracing::warn!(%err, "global limit subscribe failed");
                        } else {
                            let mut stream = pubsub.on_message();
                            while let Some(msg) = stream.next().await {
                                let Some(limiter) = this.upgrade() else { return };
                                if let Ok(key) = msg.get_payload::<String>() {
                                    limiter.cache.delete(&key);
                                }
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%err, "global limit pubsub connect failed");
                    }
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_expires_and_sweeps() {
        let cache = MemCache::default();
        cache.set(
            "a@x",
            CacheItem {
                ips: HashSet::from(["1.1.1.1".to_string()]),
                expire: Instant::now() + Duration::from_secs(60),
            },
        );
        cache.set(
            "b@x",
            CacheItem {
                ips: HashSet::new(),
                expire: Instant::now() - Duration::from_secs(1),
            },
        );
        assert!(cache.get("a@x").is_some());
        assert!(cache.get("b@x").is_none());
        cache.sweep();
        assert!(!cache.items.contains_key("b@x"));
        assert!(cache.items.contains_key("a@x"));

        cache.delete("a@x");
        assert!(cache.get("a@x").is_none());
    }
}
