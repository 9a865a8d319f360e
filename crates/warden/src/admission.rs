//! Mute-on-join for manually-admitted newcomers.
//!
//! When an admin waves a user in by hand (left/kicked → member) the group can
//! opt to mute them until an admin lifts it. Members the coordinator itself
//! approved carry a short-lived cache marker and are left alone.

use std::sync::Arc;
use std::time::Duration;

use gatehouse_common::constants::cache_keys;
use gatehouse_common::{
    AuditEvent, ChatRef, GroupId, MemberStatus, RestrictionRecord, RestrictionType, UserId,
    WardenError,
};

use crate::cache::EphemeralCache;
use crate::gateway::{MemberPermissions, PlatformGateway, SendOptions};
use crate::notify::NotificationSink;
use crate::policy::PolicyRepository;
use crate::store::Store;
use crate::tasks;

pub struct NewMemberMuter {
    policies: Arc<PolicyRepository>,
    store: Arc<Store>,
    cache: Arc<dyn EphemeralCache>,
    gateway: Arc<dyn PlatformGateway>,
    sink: Arc<dyn NotificationSink>,
}

impl NewMemberMuter {
    pub fn new(
        policies: Arc<PolicyRepository>,
        store: Arc<Store>,
        cache: Arc<dyn EphemeralCache>,
        gateway: Arc<dyn PlatformGateway>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            policies,
            store,
            cache,
            gateway,
            sink,
        }
    }

    pub async fn handle_membership_change(
        &self,
        group: GroupId,
        user: UserId,
        old_status: MemberStatus,
        new_status: MemberStatus,
    ) -> Result<(), WardenError> {
        let arrived = matches!(old_status, MemberStatus::Left | MemberStatus::Kicked)
            && new_status == MemberStatus::Member;
        if !arrived {
            return Ok(());
        }

        // Members the coordinator approved passed a challenge already; the
        // marker is single-use.
        let marker = cache_keys::approval_marker(group, user);
        if self.cache.exists(&marker).await.unwrap_or(false) {
            let _ = self.cache.delete(&marker).await;
            tracing::debug!(group_id = %group, user_id = %user, "Challenge-approved member, skipping mute");
            return Ok(());
        }

        let policy = self.policies.get(group).await?;
        if !policy.mute_new_members {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp();
        let until = if policy.mute_duration_secs == 0 {
            None
        } else {
            Some(now + policy.mute_duration_secs)
        };

        self.gateway
            .restrict_member(group, user, MemberPermissions::muted(), until)
            .await?;

        if let Err(e) = self
            .store
            .append_restriction(RestrictionRecord {
                group_id: group,
                user_id: user,
                kind: RestrictionType::Mute,
                reason: "auto-mute on manual admission".to_string(),
                created_at: now,
                expires_at: until,
            })
            .await
        {
            tracing::error!(group_id = %group, user_id = %user, error = %e, "Restriction record write failed");
        }

        self.sink
            .emit(&AuditEvent::MemberMuted {
                group_id: group,
                user_id: user,
                until,
            })
            .await;

        if let Ok(notice) = self
            .gateway
            .send_message(
                ChatRef::Group(group),
                &format!("🔇 New member {user} was muted pending admin review."),
                SendOptions::default(),
            )
            .await
        {
            tasks::delete_after(
                self.gateway.clone(),
                notice,
                Duration::from_secs(gatehouse_common::constants::VIOLATION_NOTICE_DELETE_SECS),
            );
        }

        tracing::info!(group_id = %group, user_id = %user, ?until, "Manually-admitted member muted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::gateway::testing::RecordingGateway;
    use crate::notify::LogSink;
    use gatehouse_common::PolicyPatch;

    const GROUP: GroupId = GroupId(-3003);
    const USER: UserId = UserId(12);

    struct Fixture {
        _dir: tempfile::TempDir,
        muter: NewMemberMuter,
        gateway: Arc<RecordingGateway>,
        cache: Arc<dyn EphemeralCache>,
        policies: Arc<PolicyRepository>,
        store: Arc<Store>,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("a.sqlite")).await.unwrap());
        let cache: Arc<dyn EphemeralCache> = Arc::new(MemoryCache::new());
        let gateway = Arc::new(RecordingGateway::new());
        let policies = Arc::new(PolicyRepository::new(store.clone(), cache.clone()));

        let muter = NewMemberMuter::new(
            policies.clone(),
            store.clone(),
            cache.clone(),
            gateway.clone(),
            Arc::new(LogSink),
        );

        Fixture {
            _dir: dir,
            muter,
            gateway,
            cache,
            policies,
            store,
        }
    }

    async fn enable_mute(fixture: &Fixture, duration_secs: i64) {
        fixture
            .policies
            .upsert(
                GROUP,
                PolicyPatch {
                    mute_new_members: Some(true),
                    mute_duration_secs: Some(duration_secs),
                    ..PolicyPatch::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn manual_admissions_get_muted() {
        let fixture = fixture().await;
        enable_mute(&fixture, 0).await;

        fixture
            .muter
            .handle_membership_change(GROUP, USER, MemberStatus::Left, MemberStatus::Member)
            .await
            .unwrap();

        let restrictions = fixture.gateway.restrictions();
        assert_eq!(restrictions.len(), 1);
        assert_eq!(restrictions[0].2, None);

        let records = fixture.store.restrictions_for(GROUP).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].reason.contains("manual admission"));
    }

    #[tokio::test]
    async fn bounded_mutes_carry_a_deadline() {
        let fixture = fixture().await;
        enable_mute(&fixture, 3600).await;

        let before = chrono::Utc::now().timestamp();
        fixture
            .muter
            .handle_membership_change(GROUP, USER, MemberStatus::Kicked, MemberStatus::Member)
            .await
            .unwrap();

        let until = fixture.gateway.restrictions()[0].2.unwrap();
        assert!(until >= before + 3600 && until <= before + 3700);
    }

    #[tokio::test]
    async fn challenge_approved_members_are_left_alone() {
        let fixture = fixture().await;
        enable_mute(&fixture, 0).await;

        fixture
            .cache
            .set(&cache_keys::approval_marker(GROUP, USER), "1", None)
            .await
            .unwrap();

        fixture
            .muter
            .handle_membership_change(GROUP, USER, MemberStatus::Left, MemberStatus::Member)
            .await
            .unwrap();

        assert!(fixture.gateway.restrictions().is_empty());
        // The marker is consumed.
        assert!(
            !fixture
                .cache
                .exists(&cache_keys::approval_marker(GROUP, USER))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn other_transitions_and_disabled_policy_are_ignored() {
        let fixture = fixture().await;
        enable_mute(&fixture, 0).await;

        // Promotion, not admission.
        fixture
            .muter
            .handle_membership_change(
                GROUP,
                USER,
                MemberStatus::Member,
                MemberStatus::Administrator,
            )
            .await
            .unwrap();
        assert!(fixture.gateway.restrictions().is_empty());

        // Policy off.
        fixture
            .policies
            .upsert(
                GROUP,
                PolicyPatch {
                    mute_new_members: Some(false),
                    ..PolicyPatch::default()
                },
            )
            .await
            .unwrap();
        fixture
            .muter
            .handle_membership_change(GROUP, USER, MemberStatus::Left, MemberStatus::Member)
            .await
            .unwrap();
        assert!(fixture.gateway.restrictions().is_empty());
    }
}
