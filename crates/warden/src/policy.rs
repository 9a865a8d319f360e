//! Write-through policy repository binding the durable store and the cache.
//!
//! Writes always land in the store first, then refresh the cached copy, so a
//! crash between the two leaves the cache stale but never ahead of the store.
//! Reads prefer the cache and repair it on a miss. The staleness window is
//! one failed cache refresh wide and closes on the next read-through.

use std::sync::Arc;

use gatehouse_common::constants::cache_keys;
use gatehouse_common::{GroupId, GroupPolicy, PolicyPatch, UserId, WardenError};

use crate::cache::EphemeralCache;
use crate::store::Store;

pub struct PolicyRepository {
    store: Arc<Store>,
    cache: Arc<dyn EphemeralCache>,
}

impl PolicyRepository {
    pub fn new(store: Arc<Store>, cache: Arc<dyn EphemeralCache>) -> Self {
        Self { store, cache }
    }

    /// Fetch the policy for `group`, creating the all-disabled default on
    /// first reference. Missing configuration is never an error.
    pub async fn get(&self, group: GroupId) -> Result<GroupPolicy, WardenError> {
        let key = cache_keys::policy(group);

        match self.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<GroupPolicy>(&raw) {
                Ok(policy) => return Ok(policy),
                Err(e) => {
                    // A corrupt cached copy is repaired from the store.
                    tracing::warn!(group_id = %group, error = %e, "Discarding unreadable cached policy");
                    let _ = self.cache.delete(&key).await;
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(group_id = %group, error = %e, "Policy cache read failed, falling back to store");
            }
        }

        let policy = self.store.ensure_policy(group).await?;
        self.refresh_cache(group, &policy).await;
        Ok(policy)
    }

    /// Apply `patch` to the group's policy: durable store first, then the
    /// cached copy.
    pub async fn upsert(
        &self,
        group: GroupId,
        patch: PolicyPatch,
    ) -> Result<GroupPolicy, WardenError> {
        let policy = self.store.upsert_policy(group, patch).await?;
        self.refresh_cache(group, &policy).await;
        tracing::info!(group_id = %group, "Group policy updated");
        Ok(policy)
    }

    async fn refresh_cache(&self, group: GroupId, policy: &GroupPolicy) {
        let key = cache_keys::policy(group);
        match serde_json::to_string(policy) {
            Ok(raw) => {
                if let Err(e) = self.cache.set(&key, &raw, None).await {
                    tracing::warn!(group_id = %group, error = %e, "Policy cache refresh failed");
                }
            }
            Err(e) => {
                tracing::warn!(group_id = %group, error = %e, "Policy serialization failed");
            }
        }
    }

    /// Record the acting user's handle on a group the first time it shows up.
    pub async fn remember_group(
        &self,
        group: GroupId,
        title: String,
        creator: Option<UserId>,
    ) -> Result<(), WardenError> {
        self.store.upsert_group(group, title, creator).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use gatehouse_common::ChallengeKind;

    async fn repo() -> (tempfile::TempDir, Arc<dyn EphemeralCache>, PolicyRepository) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("p.sqlite")).await.unwrap());
        let cache: Arc<dyn EphemeralCache> = Arc::new(MemoryCache::new());
        let repo = PolicyRepository::new(store, cache.clone());
        (dir, cache, repo)
    }

    #[tokio::test]
    async fn first_reference_creates_the_default() {
        let (_dir, _cache, repo) = repo().await;
        let policy = repo.get(GroupId(-1)).await.unwrap();
        assert_eq!(policy, GroupPolicy::default());
    }

    #[tokio::test]
    async fn upsert_is_visible_from_both_paths() {
        let (_dir, cache, repo) = repo().await;
        let group = GroupId(-2);

        repo.upsert(
            group,
            PolicyPatch {
                challenge_enabled: Some(true),
                challenge_kind: Some(ChallengeKind::Visual),
                ..PolicyPatch::default()
            },
        )
        .await
        .unwrap();

        // Served from cache.
        let cached = repo.get(group).await.unwrap();
        assert!(cached.challenge_enabled);

        // Served from the store after the cached copy is gone, and the cache
        // is repopulated on the way out.
        cache
            .delete(&cache_keys::policy(group))
            .await
            .unwrap();
        let from_store = repo.get(group).await.unwrap();
        assert_eq!(from_store.challenge_kind, ChallengeKind::Visual);
        assert!(
            cache
                .exists(&cache_keys::policy(group))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn corrupt_cache_entries_are_repaired() {
        let (_dir, cache, repo) = repo().await;
        let group = GroupId(-3);

        repo.upsert(
            group,
            PolicyPatch {
                photo_filter_enabled: Some(true),
                ..PolicyPatch::default()
            },
        )
        .await
        .unwrap();

        cache
            .set(&cache_keys::policy(group), "not json", None)
            .await
            .unwrap();

        let policy = repo.get(group).await.unwrap();
        assert!(policy.photo_filter_enabled);
    }
}
