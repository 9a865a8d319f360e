//! Ephemeral key/value cache with native per-key expiration.
//!
//! Backed by Redis in production. When Redis is unreachable at startup the
//! engine degrades to an in-process TTL map so that join screening keeps
//! working on a single node; the same map backs tests.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use gatehouse_common::WardenError;

/// TTL-native key/value store interface.
///
/// Every write may carry an expiration; `exists` on an expired key is false
/// without any cleanup pass.
#[async_trait]
pub trait EphemeralCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, WardenError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), WardenError>;
    async fn delete(&self, key: &str) -> Result<(), WardenError>;
    async fn exists(&self, key: &str) -> Result<bool, WardenError>;
    /// Remaining lifetime of `key`, or `None` if absent or without expiry.
    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>, WardenError>;
}

/// Redis-backed cache (auto-reconnecting connection manager).
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, WardenError> {
        let client = redis::Client::open(url)
            .map_err(|e| WardenError::Cache(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| WardenError::Cache(format!("redis connect failed: {e}")))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl EphemeralCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, WardenError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| WardenError::Cache(e.to_string()))?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), WardenError> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                .await
                .map_err(|e| WardenError::Cache(e.to_string())),
            None => conn
                .set::<_, _, ()>(key, value)
                .await
                .map_err(|e| WardenError::Cache(e.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), WardenError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(key)
            .await
            .map_err(|e| WardenError::Cache(e.to_string()))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, WardenError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .exists(key)
            .await
            .map_err(|e| WardenError::Cache(e.to_string()))?;
        Ok(exists)
    }

    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>, WardenError> {
        let mut conn = self.conn.clone();
        // TTL returns -2 for a missing key and -1 for a key without expiry.
        let ttl: i64 = conn
            .ttl(key)
            .await
            .map_err(|e| WardenError::Cache(e.to_string()))?;
        if ttl > 0 {
            Ok(Some(Duration::from_secs(ttl as u64)))
        } else {
            Ok(None)
        }
    }
}

/// In-process fallback cache with the same expiration semantics.
///
/// Expired entries are dropped lazily on access.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        match entries.get(key) {
            Some((_, Some(deadline))) if *deadline <= Instant::now() => {
                entries.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl EphemeralCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, WardenError> {
        Ok(self.live_value(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), WardenError> {
        let deadline = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .expect("cache mutex poisoned")
            .insert(key.to_string(), (value.to_string(), deadline));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), WardenError> {
        self.entries
            .lock()
            .expect("cache mutex poisoned")
            .remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, WardenError> {
        Ok(self.live_value(key).is_some())
    }

    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>, WardenError> {
        let entries = self.entries.lock().expect("cache mutex poisoned");
        match entries.get(key) {
            Some((_, Some(deadline))) => {
                let now = Instant::now();
                if *deadline > now {
                    Ok(Some(*deadline - now))
                } else {
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }
}
