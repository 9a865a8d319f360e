//! Administrative authorization.
//!
//! A user administers a group if they are the recorded creator, have an
//! explicit admin row, or the platform says so right now, in which case the
//! fact is memoized into the admin table so the next check stays local.
//! Every policy mutation goes through [`AdminRegistry::require_admin`].

use std::sync::Arc;

use gatehouse_common::{GroupId, UserId, WardenError};

use crate::gateway::PlatformGateway;
use crate::store::Store;

pub struct AdminRegistry {
    store: Arc<Store>,
    gateway: Arc<dyn PlatformGateway>,
}

impl AdminRegistry {
    pub fn new(store: Arc<Store>, gateway: Arc<dyn PlatformGateway>) -> Self {
        Self { store, gateway }
    }

    pub async fn is_admin(&self, group: GroupId, user: UserId) -> Result<bool, WardenError> {
        if self.store.group_creator(group).await? == Some(user) {
            return Ok(true);
        }
        if self.store.is_recorded_admin(group, user).await? {
            return Ok(true);
        }

        match self.gateway.get_chat_member(group, user).await {
            Ok(status) if status.is_admin() => {
                if let Err(e) = self.store.record_admin(group, user).await {
                    tracing::warn!(group_id = %group, user_id = %user, error = %e, "Admin memoization failed");
                }
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(e) => {
                // An unreachable platform is a denial, not a system error.
                tracing::warn!(group_id = %group, user_id = %user, error = %e, "Live admin lookup failed");
                Ok(false)
            }
        }
    }

    /// Gate for settings mutations.
    pub async fn require_admin(&self, group: GroupId, user: UserId) -> Result<(), WardenError> {
        if self.is_admin(group, user).await? {
            Ok(())
        } else {
            Err(WardenError::Unauthorized(format!(
                "user {user} does not administer group {group}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::RecordingGateway;
    use gatehouse_common::MemberStatus;

    const GROUP: GroupId = GroupId(-4004);

    async fn fixture() -> (tempfile::TempDir, Arc<Store>, Arc<RecordingGateway>, AdminRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("adm.sqlite")).await.unwrap());
        let gateway = Arc::new(RecordingGateway::new());
        let registry = AdminRegistry::new(store.clone(), gateway.clone());
        (dir, store, gateway, registry)
    }

    #[tokio::test]
    async fn recorded_creator_is_an_admin() {
        let (_dir, store, _gateway, registry) = fixture().await;
        store
            .upsert_group(GROUP, "g".into(), Some(UserId(1)))
            .await
            .unwrap();

        assert!(registry.is_admin(GROUP, UserId(1)).await.unwrap());
        assert!(!registry.is_admin(GROUP, UserId(2)).await.unwrap());
    }

    #[tokio::test]
    async fn live_lookup_is_memoized() {
        let (_dir, store, gateway, registry) = fixture().await;
        gateway.set_member_status(GROUP, UserId(5), MemberStatus::Administrator);

        assert!(registry.is_admin(GROUP, UserId(5)).await.unwrap());
        // The fact landed in the table, so a later check works even if the
        // platform stops reporting it.
        assert!(store.is_recorded_admin(GROUP, UserId(5)).await.unwrap());

        gateway.set_member_status(GROUP, UserId(5), MemberStatus::Member);
        assert!(registry.is_admin(GROUP, UserId(5)).await.unwrap());
    }

    #[tokio::test]
    async fn require_admin_denies_plain_members() {
        let (_dir, _store, _gateway, registry) = fixture().await;

        let err = registry.require_admin(GROUP, UserId(9)).await.unwrap_err();
        assert!(matches!(err, WardenError::Unauthorized(_)));
        assert_eq!(err.status_code(), 403);
    }
}
