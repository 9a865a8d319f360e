//! Per-user cool-down windows backed by the cache's native expiration.
//!
//! "Limited" is simply "the key is present and unexpired"; no sweeper task.

use std::sync::Arc;
use std::time::Duration;

use gatehouse_common::constants::cache_keys;
use gatehouse_common::{UserId, WardenError};

use crate::cache::EphemeralCache;

#[derive(Clone)]
pub struct RateLimiter {
    cache: Arc<dyn EphemeralCache>,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn EphemeralCache>) -> Self {
        Self { cache }
    }

    pub async fn set_limit(&self, user: UserId, duration: Duration) -> Result<(), WardenError> {
        self.cache
            .set(
                &cache_keys::rate_limit(user),
                &duration.as_secs().to_string(),
                Some(duration),
            )
            .await
    }

    pub async fn is_limited(&self, user: UserId) -> Result<bool, WardenError> {
        self.cache.exists(&cache_keys::rate_limit(user)).await
    }

    /// Seconds left on the user's window; 0 when not limited.
    pub async fn time_remaining(&self, user: UserId) -> Result<u64, WardenError> {
        Ok(self
            .cache
            .ttl_remaining(&cache_keys::rate_limit(user))
            .await?
            .map(|d| d.as_secs())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    #[tokio::test]
    async fn limit_expires_on_its_own() {
        let limiter = RateLimiter::new(Arc::new(MemoryCache::new()));
        let user = UserId(1);

        assert!(!limiter.is_limited(user).await.unwrap());

        limiter
            .set_limit(user, Duration::from_millis(30))
            .await
            .unwrap();
        assert!(limiter.is_limited(user).await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!limiter.is_limited(user).await.unwrap());
        assert_eq!(limiter.time_remaining(user).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn time_remaining_is_bounded_by_the_window() {
        let limiter = RateLimiter::new(Arc::new(MemoryCache::new()));
        let user = UserId(2);

        limiter
            .set_limit(user, Duration::from_secs(60))
            .await
            .unwrap();
        let left = limiter.time_remaining(user).await.unwrap();
        assert!(left <= 60);
    }
}
