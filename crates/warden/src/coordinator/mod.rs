//! Join-request coordinator.
//!
//! Drives one membership request from arrival to a terminal outcome:
//!
//! ```text
//! NoRequest → Pending → ChallengeIssued → {Approved | Rejected | Expired}
//! ```
//!
//! Terminal states are absorbing; a later join request supersedes the old row
//! and removes its on-screen artifacts. The answer path and the scheduled
//! timeout race for the terminal transition; whoever wins the status
//! compare-and-set owns the side effects, the loser is a silent no-op. The
//! timeout task is never cancelled; it just loses the CAS when the request
//! resolved first, which keeps it idempotent without a cancellation registry.

mod token;

use std::sync::Arc;
use std::time::Duration;

use gatehouse_common::constants::cache_keys;
use gatehouse_common::{
    AuditEvent, ChallengeKind, ChatRef, GroupId, GroupPolicy, MembershipRequest, MessageRef,
    RequestStatus, UserId, Verdict, WardenError,
};

use crate::cache::EphemeralCache;
use crate::challenge::{ChallengeEngine, ChallengePresentation, StoredChallenge};
use crate::config::ChallengeSettings;
use crate::gateway::{AnswerOption, PlatformGateway, SendOptions, is_message_missing};
use crate::notify::NotificationSink;
use crate::policy::PolicyRepository;
use crate::ratelimit::RateLimiter;
use crate::store::Store;
use crate::tasks;
use token::TokenCommand;

#[derive(Clone)]
pub struct JoinCoordinator {
    policies: Arc<PolicyRepository>,
    store: Arc<Store>,
    cache: Arc<dyn EphemeralCache>,
    gateway: Arc<dyn PlatformGateway>,
    limiter: RateLimiter,
    sink: Arc<dyn NotificationSink>,
    engine: ChallengeEngine,
    settings: ChallengeSettings,
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, WardenError> {
    serde_json::to_string(value).map_err(|e| WardenError::Internal(e.to_string()))
}

impl JoinCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        policies: Arc<PolicyRepository>,
        store: Arc<Store>,
        cache: Arc<dyn EphemeralCache>,
        gateway: Arc<dyn PlatformGateway>,
        limiter: RateLimiter,
        sink: Arc<dyn NotificationSink>,
        engine: ChallengeEngine,
        settings: ChallengeSettings,
    ) -> Self {
        Self {
            policies,
            store,
            cache,
            gateway,
            limiter,
            sink,
            engine,
            settings,
        }
    }

    fn ttl_secs(&self, kind: ChallengeKind) -> u64 {
        match kind {
            ChallengeKind::Arithmetic => self.settings.arithmetic_ttl_secs,
            ChallengeKind::Visual => self.settings.visual_ttl_secs,
        }
    }

    /// A join request arrived. With screening disabled this is a no-op: the
    /// membership decision stays with the platform's own default flow.
    pub async fn handle_join_request(
        &self,
        group: GroupId,
        user: UserId,
        user_display: &str,
    ) -> Result<(), WardenError> {
        let policy = self.policies.get(group).await?;
        if !policy.challenge_enabled {
            tracing::debug!(group_id = %group, user_id = %user, "Challenge disabled, leaving request to the platform");
            return Ok(());
        }

        // Keep the group's handle on file for the admin surface.
        if let Ok(info) = self.gateway.get_chat_info(group).await {
            if let Err(e) = self.policies.remember_group(group, info.title, None).await {
                tracing::warn!(group_id = %group, error = %e, "Group bookkeeping failed");
            }
        }

        if self.limiter.is_limited(user).await? {
            let wait = self.limiter.time_remaining(user).await?;
            tracing::debug!(user_id = %user, wait, "Join request during cool-down");
            if let Ok(notice) = self
                .gateway
                .send_message(
                    ChatRef::User(user),
                    &format!("Please wait {wait}s before trying again."),
                    SendOptions::default(),
                )
                .await
            {
                tasks::delete_after(
                    self.gateway.clone(),
                    notice,
                    Duration::from_secs(gatehouse_common::constants::WAIT_NOTICE_DELETE_SECS),
                );
            }
            return Ok(());
        }

        // At most one live challenge artifact per (group, user): remove
        // leftovers from any earlier request before starting over.
        self.clear_artifacts(group, user).await;
        self.store.begin_request(group, user).await?;
        self.issue(group, user, Some(user_display), &policy, 0, None)
            .await
    }

    /// Remove on-screen and cached leftovers of a previous request.
    async fn clear_artifacts(&self, group: GroupId, user: UserId) {
        if let Ok(Some(request)) = self.store.get_request(group, user).await {
            for message in [request.challenge_message, request.timeout_notice]
                .into_iter()
                .flatten()
            {
                if let Err(e) = self.gateway.delete_message(message).await {
                    if !is_message_missing(&e) {
                        tracing::debug!(user_id = %user, error = %e, "Stale artifact cleanup failed");
                    }
                }
            }
        }
        let _ = self.cache.delete(&cache_keys::challenge(group, user)).await;
        let _ = self.cache.delete(&cache_keys::pending_group(user)).await;
    }

    /// Generate a challenge, persist it (store for audit, cache for the
    /// TTL-bounded live record), put it on screen and schedule the timeout.
    async fn issue(
        &self,
        group: GroupId,
        user: UserId,
        greeting: Option<&str>,
        policy: &GroupPolicy,
        attempts: u32,
        existing: Option<MessageRef>,
    ) -> Result<(), WardenError> {
        let generated = self.engine.generate(policy.challenge_kind);
        let ttl = self.ttl_secs(generated.kind);
        let now = chrono::Utc::now().timestamp();
        let expires_at = now + ttl as i64;

        let stored = StoredChallenge {
            answer: generated.answer.clone(),
            kind: generated.kind,
            issued_at: now,
            expires_at,
            attempts,
        };
        self.cache
            .set(
                &cache_keys::challenge(group, user),
                &to_json(&stored)?,
                Some(Duration::from_secs(ttl)),
            )
            .await?;
        self.store
            .record_challenge(
                group,
                user,
                generated.kind,
                generated.answer,
                now,
                expires_at,
                attempts,
            )
            .await?;

        let group_label = self.group_label(group).await;
        let target = if policy.challenge_in_pm {
            ChatRef::User(user)
        } else {
            ChatRef::Group(group)
        };

        let message = match generated.presentation {
            ChallengePresentation::Options { question, options } => {
                let mut answer_options = Vec::with_capacity(options.len());
                for label in options {
                    let minted = token::mint();
                    let command = TokenCommand::Answer {
                        group_id: group,
                        user_id: user,
                        value: label.clone(),
                    };
                    self.cache
                        .set(
                            &cache_keys::answer_token(&minted),
                            &command.encode()?,
                            Some(Duration::from_secs(ttl)),
                        )
                        .await?;
                    answer_options.push(AnswerOption {
                        label,
                        token: minted,
                    });
                }

                let text = match greeting {
                    Some(name) => format!(
                        "👋 Hi {name}!\n\nTo join {group_label}, solve this:\n\n{question}\n\nPick the right answer."
                    ),
                    None => {
                        let remaining = self.settings.max_attempts.saturating_sub(attempts);
                        format!(
                            "❌ Wrong answer. {remaining} attempt(s) left.\n\n{question}\n\nPick the right answer."
                        )
                    }
                };
                let options = SendOptions::with_options(answer_options);
                match existing {
                    // Re-issues update the displayed message in place.
                    Some(message) => {
                        self.gateway.edit_message(message, &text, options).await?;
                        Some(message)
                    }
                    None => Some(self.gateway.send_message(target, &text, options).await?),
                }
            }
            ChallengePresentation::Image { png } => {
                if let Some(old) = existing {
                    if let Err(e) = self.gateway.delete_message(old).await {
                        if !is_message_missing(&e) {
                            tracing::debug!(user_id = %user, error = %e, "Old challenge deletion failed");
                        }
                    }
                }
                let caption = format!(
                    "Type the characters you see, or solve the expression, to join {group_label}."
                );
                let message = self.gateway.send_photo(target, png, &caption).await?;
                // Typed answers carry no token; index the pending challenge
                // by user so a text message can find it.
                self.cache
                    .set(
                        &cache_keys::pending_group(user),
                        &group.0.to_string(),
                        Some(Duration::from_secs(ttl)),
                    )
                    .await?;
                Some(message)
            }
        };

        self.store.mark_challenge_issued(group, user, message).await?;
        self.sink
            .emit(&AuditEvent::ChallengeIssued {
                group_id: group,
                user_id: user,
                kind: stored.kind,
                attempt: attempts,
            })
            .await;
        tracing::info!(
            group_id = %group,
            user_id = %user,
            kind = stored.kind.as_str(),
            attempt = attempts,
            "Challenge issued"
        );

        self.schedule_timeout(group, user, Duration::from_secs(ttl));
        Ok(())
    }

    fn schedule_timeout(&self, group: GroupId, user: UserId, delay: Duration) {
        let coordinator = self.clone();
        tasks::run_after(delay, async move {
            coordinator.expire_challenge(group, user).await;
        });
    }

    /// Timeout handler. Safe to fire any number of times: only the call that
    /// wins the `ChallengeIssued → Expired` compare-and-set performs side
    /// effects; every other firing is a no-op.
    pub async fn expire_challenge(&self, group: GroupId, user: UserId) {
        let request = match self.store.get_request(group, user).await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(group_id = %group, user_id = %user, error = %e, "Timeout status read failed");
                return;
            }
        };

        // A wrong answer re-issues a fresh challenge with a fresh deadline,
        // but the timer from the superseded one still fires. Only act once
        // the live record has actually run out.
        if let Ok(Some(raw)) = self.cache.get(&cache_keys::challenge(group, user)).await {
            if let Ok(live) = serde_json::from_str::<StoredChallenge>(&raw) {
                if chrono::Utc::now().timestamp() < live.expires_at {
                    tracing::debug!(group_id = %group, user_id = %user, "Challenge renewed since this timer was scheduled");
                    return;
                }
            }
        }

        let won = match self
            .store
            .transition(
                group,
                user,
                RequestStatus::ChallengeIssued,
                RequestStatus::Expired,
            )
            .await
        {
            Ok(won) => won,
            Err(e) => {
                tracing::warn!(group_id = %group, user_id = %user, error = %e, "Timeout transition failed");
                return;
            }
        };
        if !won {
            tracing::debug!(group_id = %group, user_id = %user, "Timeout fired after resolution, nothing to do");
            return;
        }

        let _ = self.cache.delete(&cache_keys::challenge(group, user)).await;
        let _ = self.cache.delete(&cache_keys::pending_group(user)).await;

        if let Some(message) = request.challenge_message {
            if let Err(e) = self.gateway.delete_message(message).await {
                if !is_message_missing(&e) {
                    tracing::warn!(user_id = %user, error = %e, "Challenge message deletion failed");
                }
            }
        }

        let group_label = self.group_label(group).await;
        match self
            .gateway
            .send_message(
                ChatRef::User(user),
                &format!(
                    "⏰ Time expired. You can send a new join request to {group_label}."
                ),
                SendOptions::default(),
            )
            .await
        {
            Ok(notice) => {
                let _ = self.store.set_timeout_notice(group, user, Some(notice)).await;
            }
            Err(e) => {
                tracing::warn!(user_id = %user, error = %e, "Timeout notice delivery failed");
            }
        }

        self.sink
            .emit(&AuditEvent::ChallengeExpired {
                group_id: group,
                user_id: user,
            })
            .await;
        tracing::info!(group_id = %group, user_id = %user, "Challenge expired");
    }

    /// An option button was pressed somewhere. Stale and duplicate tokens
    /// resolve to nothing and are dropped silently.
    pub async fn handle_answer(
        &self,
        token: &str,
        answered_by: UserId,
    ) -> Result<(), WardenError> {
        let Some(raw) = self.cache.get(&cache_keys::answer_token(token)).await? else {
            tracing::debug!(user_id = %answered_by, "Stale or unknown correlation token");
            return Ok(());
        };

        match TokenCommand::decode(&raw)? {
            TokenCommand::Answer {
                group_id,
                user_id,
                value,
            } => {
                if user_id != answered_by {
                    // Someone else pressed a button that is not theirs; the
                    // owner's attempt budget is untouched.
                    tracing::warn!(
                        group_id = %group_id,
                        owner = %user_id,
                        answered_by = %answered_by,
                        "Answer from a different user rejected"
                    );
                    return Ok(());
                }
                self.resolve_answer(group_id, user_id, &value).await
            }
        }
    }

    /// A plain text message from a user with (possibly) a pending
    /// typed-answer challenge.
    pub async fn handle_text_answer(
        &self,
        user: UserId,
        text: &str,
    ) -> Result<(), WardenError> {
        let Some(raw_group) = self.cache.get(&cache_keys::pending_group(user)).await? else {
            tracing::debug!(user_id = %user, "Text message without a pending challenge");
            return Ok(());
        };
        let group = GroupId(
            raw_group
                .parse()
                .map_err(|e| WardenError::Internal(format!("bad pending-group entry: {e}")))?,
        );
        self.resolve_answer(group, user, text).await
    }

    async fn resolve_answer(
        &self,
        group: GroupId,
        user: UserId,
        submitted: &str,
    ) -> Result<(), WardenError> {
        if self.limiter.is_limited(user).await? {
            let wait = self.limiter.time_remaining(user).await?;
            if let Ok(notice) = self
                .gateway
                .send_message(
                    ChatRef::User(user),
                    &format!("Please wait {wait}s before the next attempt."),
                    SendOptions::default(),
                )
                .await
            {
                tasks::delete_after(
                    self.gateway.clone(),
                    notice,
                    Duration::from_secs(gatehouse_common::constants::WAIT_NOTICE_DELETE_SECS),
                );
            }
            return Ok(());
        }

        let request = match self.store.get_request(group, user).await? {
            Some(request) if request.status == RequestStatus::ChallengeIssued => request,
            Some(request) => {
                tracing::debug!(
                    group_id = %group,
                    user_id = %user,
                    status = request.status.as_str(),
                    "Answer for an already-resolved request"
                );
                return Ok(());
            }
            None => {
                tracing::debug!(group_id = %group, user_id = %user, "Answer without a request on file");
                return Ok(());
            }
        };

        let Some(raw) = self.cache.get(&cache_keys::challenge(group, user)).await? else {
            // The TTL outran the timeout task; tell the user to start over.
            let group_label = self.group_label(group).await;
            let _ = self
                .gateway
                .send_message(
                    ChatRef::User(user),
                    &format!(
                        "This challenge is no longer active. Please send a new join request to {group_label}."
                    ),
                    SendOptions::default(),
                )
                .await;
            return Ok(());
        };
        let stored: StoredChallenge =
            serde_json::from_str(&raw).map_err(|e| WardenError::Internal(e.to_string()))?;

        let now = chrono::Utc::now().timestamp();
        match self.engine.verify(&stored, submitted, now) {
            Verdict::Correct => self.approve(group, user, &request).await,
            Verdict::Incorrect => {
                let used = stored.attempts + 1;
                self.sink
                    .emit(&AuditEvent::ChallengeFailed {
                        group_id: group,
                        user_id: user,
                        reason: format!(
                            "incorrect answer (attempt {used}/{})",
                            self.settings.max_attempts
                        ),
                    })
                    .await;
                if used < self.settings.max_attempts {
                    // Fresh operands, same budget, displayed in place.
                    let policy = self.policies.get(group).await?;
                    self.issue(group, user, None, &policy, used, request.challenge_message)
                        .await
                } else {
                    self.reject(group, user, &request, "Too many wrong answers")
                        .await
                }
            }
            Verdict::Expired => {
                // Same terminal path as a spent budget, but the attempt is
                // not consumed.
                self.reject(group, user, &request, "The challenge expired")
                    .await
            }
            Verdict::Exhausted => {
                self.reject(group, user, &request, "Too many wrong answers")
                    .await
            }
        }
    }

    async fn approve(
        &self,
        group: GroupId,
        user: UserId,
        request: &MembershipRequest,
    ) -> Result<(), WardenError> {
        // The platform call comes first: if it fails the request stays in its
        // last consistent state and the user is told this was not a wrong
        // answer.
        if let Err(e) = self.gateway.approve_join_request(group, user).await {
            tracing::error!(group_id = %group, user_id = %user, error = %e, "Approval call failed after a correct answer");
            let _ = self
                .gateway
                .send_message(
                    ChatRef::User(user),
                    "⚠️ Your answer was correct, but approving the request failed. Please try again in a moment.",
                    SendOptions::default(),
                )
                .await;
            return Ok(());
        }

        // Mark this approval as ours so the mute-on-join handler leaves the
        // member alone.
        let _ = self
            .cache
            .set(
                &cache_keys::approval_marker(group, user),
                "1",
                Some(Duration::from_secs(
                    gatehouse_common::constants::APPROVAL_MARKER_TTL_SECS,
                )),
            )
            .await;

        let won = self
            .store
            .transition(
                group,
                user,
                RequestStatus::ChallengeIssued,
                RequestStatus::Approved,
            )
            .await?;
        if !won {
            tracing::debug!(group_id = %group, user_id = %user, "Request resolved concurrently with approval");
        }

        let _ = self.cache.delete(&cache_keys::challenge(group, user)).await;
        let _ = self.cache.delete(&cache_keys::pending_group(user)).await;

        let group_label = self.group_label(group).await;
        let confirmation =
            format!("✅ Correct! Your request to join {group_label} has been approved.");
        match request.challenge_message {
            Some(message) => {
                if let Err(e) = self
                    .gateway
                    .edit_message(message, &confirmation, SendOptions::default())
                    .await
                {
                    tracing::debug!(user_id = %user, error = %e, "Challenge message edit failed");
                }
            }
            None => {
                let _ = self
                    .gateway
                    .send_message(ChatRef::User(user), &confirmation, SendOptions::default())
                    .await;
            }
        }

        self.sink
            .emit(&AuditEvent::ChallengeSolved {
                group_id: group,
                user_id: user,
            })
            .await;
        self.sink
            .emit(&AuditEvent::MemberApproved {
                group_id: group,
                user_id: user,
            })
            .await;
        tracing::info!(group_id = %group, user_id = %user, "Join request approved");
        Ok(())
    }

    async fn reject(
        &self,
        group: GroupId,
        user: UserId,
        request: &MembershipRequest,
        reason: &str,
    ) -> Result<(), WardenError> {
        let cooldown = Duration::from_secs(self.settings.cooldown_secs);
        if let Err(e) = self.limiter.set_limit(user, cooldown).await {
            tracing::warn!(user_id = %user, error = %e, "Cool-down write failed");
        }

        let _ = self.cache.delete(&cache_keys::challenge(group, user)).await;
        let _ = self.cache.delete(&cache_keys::pending_group(user)).await;

        let won = self
            .store
            .transition(
                group,
                user,
                RequestStatus::ChallengeIssued,
                RequestStatus::Rejected,
            )
            .await?;
        if !won {
            tracing::debug!(group_id = %group, user_id = %user, "Request resolved concurrently with rejection");
        }

        if let Some(message) = request.challenge_message {
            if let Err(e) = self.gateway.delete_message(message).await {
                if !is_message_missing(&e) {
                    tracing::debug!(user_id = %user, error = %e, "Challenge message deletion failed");
                }
            }
        }

        let group_label = self.group_label(group).await;
        let _ = self
            .gateway
            .send_message(
                ChatRef::User(user),
                &format!(
                    "❌ {reason}. Please wait {}s, then submit a new join request to {group_label}.",
                    cooldown.as_secs()
                ),
                SendOptions::default(),
            )
            .await;

        self.sink
            .emit(&AuditEvent::ChallengeFailed {
                group_id: group,
                user_id: user,
                reason: reason.to_string(),
            })
            .await;
        self.sink
            .emit(&AuditEvent::MemberRejected {
                group_id: group,
                user_id: user,
            })
            .await;
        tracing::info!(group_id = %group, user_id = %user, reason, "Join request rejected");
        Ok(())
    }

    /// Human-readable group reference for notices. A failed lookup (or a
    /// group without a public handle) degrades to plain text instead of
    /// aborting the flow.
    async fn group_label(&self, group: GroupId) -> String {
        match self.gateway.get_chat_info(group).await {
            Ok(info) => match info.public_handle {
                Some(handle) => format!("{} (@{handle})", info.title),
                None => info.title,
            },
            Err(e) => {
                tracing::debug!(group_id = %group, error = %e, "Chat info lookup failed, using plain reference");
                "the group".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::gateway::testing::RecordingGateway;
    use crate::notify::LogSink;
    use gatehouse_common::PolicyPatch;
    use std::sync::atomic::Ordering;

    const GROUP: GroupId = GroupId(-1001);
    const USER: UserId = UserId(42);

    struct Fixture {
        _dir: tempfile::TempDir,
        coordinator: Arc<JoinCoordinator>,
        gateway: Arc<RecordingGateway>,
        cache: Arc<dyn EphemeralCache>,
        store: Arc<Store>,
        policies: Arc<PolicyRepository>,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("c.sqlite")).await.unwrap());
        let cache: Arc<dyn EphemeralCache> = Arc::new(MemoryCache::new());
        let gateway = Arc::new(RecordingGateway::new());
        let policies = Arc::new(PolicyRepository::new(store.clone(), cache.clone()));
        let limiter = RateLimiter::new(cache.clone());

        let settings = ChallengeSettings::default();
        let coordinator = Arc::new(JoinCoordinator::new(
            policies.clone(),
            store.clone(),
            cache.clone(),
            gateway.clone(),
            limiter,
            Arc::new(LogSink),
            ChallengeEngine::new(None, settings.max_attempts),
            settings,
        ));

        Fixture {
            _dir: dir,
            coordinator,
            gateway,
            cache,
            store,
            policies,
        }
    }

    async fn enable_challenge(fixture: &Fixture) {
        fixture
            .policies
            .upsert(
                GROUP,
                PolicyPatch {
                    challenge_enabled: Some(true),
                    ..PolicyPatch::default()
                },
            )
            .await
            .unwrap();
    }

    async fn stored_challenge(fixture: &Fixture) -> StoredChallenge {
        let raw = fixture
            .cache
            .get(&cache_keys::challenge(GROUP, USER))
            .await
            .unwrap()
            .expect("challenge record missing");
        serde_json::from_str(&raw).unwrap()
    }

    /// Token of the option matching (or not matching) the stored answer.
    async fn pick_option(fixture: &Fixture, correct: bool) -> String {
        let answer = stored_challenge(fixture).await.answer;
        let options = fixture.gateway.last_options().expect("no options on screen");
        options
            .iter()
            .find(|o| (o.label == answer) == correct)
            .expect("no matching option")
            .token
            .clone()
    }

    #[tokio::test]
    async fn disabled_policy_means_no_action() {
        let fixture = fixture().await;

        fixture
            .coordinator
            .handle_join_request(GROUP, USER, "Alice")
            .await
            .unwrap();

        assert!(fixture.gateway.recorded().is_empty());
        assert!(fixture.store.get_request(GROUP, USER).await.unwrap().is_none());
        assert!(
            !fixture
                .cache
                .exists(&cache_keys::challenge(GROUP, USER))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn correct_answer_approves_exactly_once() {
        let fixture = fixture().await;
        enable_challenge(&fixture).await;

        fixture
            .coordinator
            .handle_join_request(GROUP, USER, "Alice")
            .await
            .unwrap();

        // Four distinct options, the answer among them exactly once.
        let answer = stored_challenge(&fixture).await.answer;
        let options = fixture.gateway.last_options().unwrap();
        assert_eq!(options.len(), 4);
        assert_eq!(options.iter().filter(|o| o.label == answer).count(), 1);

        let token = pick_option(&fixture, true).await;
        fixture.coordinator.handle_answer(&token, USER).await.unwrap();

        assert_eq!(fixture.gateway.approvals(), 1);
        let request = fixture.store.get_request(GROUP, USER).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Approved);
        // Live challenge state is gone.
        assert!(
            !fixture
                .cache
                .exists(&cache_keys::challenge(GROUP, USER))
                .await
                .unwrap()
        );
        // The approval marker is set for the mute-on-join handler.
        assert!(
            fixture
                .cache
                .exists(&cache_keys::approval_marker(GROUP, USER))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn third_attempt_can_still_succeed() {
        let fixture = fixture().await;
        enable_challenge(&fixture).await;

        fixture
            .coordinator
            .handle_join_request(GROUP, USER, "Alice")
            .await
            .unwrap();

        for _ in 0..2 {
            let wrong = pick_option(&fixture, false).await;
            fixture.coordinator.handle_answer(&wrong, USER).await.unwrap();
        }
        // Still unresolved, fresh operands on screen.
        let request = fixture.store.get_request(GROUP, USER).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::ChallengeIssued);
        assert_eq!(stored_challenge(&fixture).await.attempts, 2);

        let token = pick_option(&fixture, true).await;
        fixture.coordinator.handle_answer(&token, USER).await.unwrap();

        assert_eq!(fixture.gateway.approvals(), 1);
        let request = fixture.store.get_request(GROUP, USER).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Approved);
    }

    #[tokio::test]
    async fn exhausted_attempts_reject_and_rate_limit() {
        let fixture = fixture().await;
        enable_challenge(&fixture).await;

        fixture
            .coordinator
            .handle_join_request(GROUP, USER, "Alice")
            .await
            .unwrap();

        for _ in 0..3 {
            let wrong = pick_option(&fixture, false).await;
            fixture.coordinator.handle_answer(&wrong, USER).await.unwrap();
        }

        let request = fixture.store.get_request(GROUP, USER).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Rejected);
        assert_eq!(fixture.gateway.approvals(), 0);

        let limiter = RateLimiter::new(fixture.cache.clone());
        assert!(limiter.is_limited(USER).await.unwrap());
        let remaining = limiter.time_remaining(USER).await.unwrap();
        assert!(remaining > 0 && remaining <= 60);

        // No further challenge was issued after the terminal transition.
        assert!(
            !fixture
                .cache
                .exists(&cache_keys::challenge(GROUP, USER))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn answers_from_other_users_consume_nothing() {
        let fixture = fixture().await;
        enable_challenge(&fixture).await;

        fixture
            .coordinator
            .handle_join_request(GROUP, USER, "Alice")
            .await
            .unwrap();

        let token = pick_option(&fixture, true).await;
        fixture
            .coordinator
            .handle_answer(&token, UserId(777))
            .await
            .unwrap();

        assert_eq!(fixture.gateway.approvals(), 0);
        let request = fixture.store.get_request(GROUP, USER).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::ChallengeIssued);
        assert_eq!(stored_challenge(&fixture).await.attempts, 0);
    }

    #[tokio::test]
    async fn timeout_is_idempotent() {
        let fixture = fixture().await;
        enable_challenge(&fixture).await;

        fixture
            .coordinator
            .handle_join_request(GROUP, USER, "Alice")
            .await
            .unwrap();

        // At the real deadline the cached record has lapsed alongside the
        // timer; model that before firing the handler twice.
        fixture
            .cache
            .delete(&cache_keys::challenge(GROUP, USER))
            .await
            .unwrap();
        fixture.coordinator.expire_challenge(GROUP, USER).await;
        fixture.coordinator.expire_challenge(GROUP, USER).await;

        let request = fixture.store.get_request(GROUP, USER).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Expired);
        // Side effects happened at most once.
        assert_eq!(fixture.gateway.deletions(), 1);
        let expired_notices = fixture
            .gateway
            .sent_texts()
            .iter()
            .filter(|t| t.contains("Time expired"))
            .count();
        assert_eq!(expired_notices, 1);
    }

    #[tokio::test]
    async fn stale_timer_spares_a_reissued_challenge() {
        let fixture = fixture().await;
        enable_challenge(&fixture).await;

        fixture
            .coordinator
            .handle_join_request(GROUP, USER, "Alice")
            .await
            .unwrap();
        // A wrong answer re-issues with a fresh deadline.
        let wrong = pick_option(&fixture, false).await;
        fixture.coordinator.handle_answer(&wrong, USER).await.unwrap();

        // The timer armed for the first challenge fires now; the live record
        // has time left, so nothing happens.
        fixture.coordinator.expire_challenge(GROUP, USER).await;

        let request = fixture.store.get_request(GROUP, USER).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::ChallengeIssued);
        assert!(
            fixture
                .cache
                .exists(&cache_keys::challenge(GROUP, USER))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn timeout_after_approval_is_a_no_op() {
        let fixture = fixture().await;
        enable_challenge(&fixture).await;

        fixture
            .coordinator
            .handle_join_request(GROUP, USER, "Alice")
            .await
            .unwrap();
        let token = pick_option(&fixture, true).await;
        fixture.coordinator.handle_answer(&token, USER).await.unwrap();

        fixture.coordinator.expire_challenge(GROUP, USER).await;

        let request = fixture.store.get_request(GROUP, USER).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Approved);
        assert_eq!(fixture.gateway.deletions(), 0);
    }

    #[tokio::test]
    async fn rerequest_removes_previous_artifacts() {
        let fixture = fixture().await;
        enable_challenge(&fixture).await;

        fixture
            .coordinator
            .handle_join_request(GROUP, USER, "Alice")
            .await
            .unwrap();
        fixture
            .cache
            .delete(&cache_keys::challenge(GROUP, USER))
            .await
            .unwrap();
        fixture.coordinator.expire_challenge(GROUP, USER).await;
        let deletions_before = fixture.gateway.deletions();

        fixture
            .coordinator
            .handle_join_request(GROUP, USER, "Alice")
            .await
            .unwrap();

        // The timeout notice from the previous attempt went away.
        assert!(fixture.gateway.deletions() > deletions_before);
        let request = fixture.store.get_request(GROUP, USER).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::ChallengeIssued);
        assert!(request.timeout_notice.is_none());
    }

    #[tokio::test]
    async fn failed_approval_is_recoverable() {
        let fixture = fixture().await;
        enable_challenge(&fixture).await;

        fixture
            .coordinator
            .handle_join_request(GROUP, USER, "Alice")
            .await
            .unwrap();

        fixture.gateway.fail_approve.store(true, Ordering::SeqCst);
        let token = pick_option(&fixture, true).await;
        fixture.coordinator.handle_answer(&token, USER).await.unwrap();

        // No terminal transition, the user was told it was not their fault.
        let request = fixture.store.get_request(GROUP, USER).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::ChallengeIssued);
        assert!(
            fixture
                .gateway
                .sent_texts()
                .iter()
                .any(|t| t.contains("approving the request failed"))
        );

        // The same answer goes through once the platform recovers.
        fixture.gateway.fail_approve.store(false, Ordering::SeqCst);
        fixture.coordinator.handle_answer(&token, USER).await.unwrap();
        assert_eq!(fixture.gateway.approvals(), 1);
        let request = fixture.store.get_request(GROUP, USER).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Approved);
    }

    #[tokio::test]
    async fn rate_limited_users_get_a_wait_notice_instead_of_a_challenge() {
        let fixture = fixture().await;
        enable_challenge(&fixture).await;

        let limiter = RateLimiter::new(fixture.cache.clone());
        limiter
            .set_limit(USER, Duration::from_secs(60))
            .await
            .unwrap();

        fixture
            .coordinator
            .handle_join_request(GROUP, USER, "Alice")
            .await
            .unwrap();

        assert!(
            !fixture
                .cache
                .exists(&cache_keys::challenge(GROUP, USER))
                .await
                .unwrap()
        );
        assert!(
            fixture
                .gateway
                .sent_texts()
                .iter()
                .any(|t| t.contains("Please wait"))
        );
    }
}
