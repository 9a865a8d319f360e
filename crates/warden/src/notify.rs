//! Notification sink: structured audit events for the moderation-log channel.
//!
//! Emission is best-effort by contract; a sink failure is logged and never
//! reaches the decision path that produced the event.

use async_trait::async_trait;
use std::sync::Arc;

use gatehouse_common::{AuditEvent, ChatRef, GroupId};

use crate::gateway::{PlatformGateway, SendOptions};

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn emit(&self, event: &AuditEvent);
}

/// Sink that posts a rendered line to an administrative channel through the
/// gateway, alongside the structured payload in the process log.
pub struct ChannelSink {
    gateway: Arc<dyn PlatformGateway>,
    channel: GroupId,
}

impl ChannelSink {
    pub fn new(gateway: Arc<dyn PlatformGateway>, channel: GroupId) -> Self {
        Self { gateway, channel }
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn emit(&self, event: &AuditEvent) {
        let payload = serde_json::to_string(event).unwrap_or_default();
        tracing::info!(kind = event.kind(), payload = %payload, "audit event");

        let line = render(event);
        if let Err(e) = self
            .gateway
            .send_message(ChatRef::Group(self.channel), &line, SendOptions::default())
            .await
        {
            tracing::warn!(kind = event.kind(), error = %e, "Audit channel delivery failed");
        }
    }
}

/// Sink that only writes to the process log. Used when no audit channel is
/// configured, and in tests.
#[derive(Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn emit(&self, event: &AuditEvent) {
        let payload = serde_json::to_string(event).unwrap_or_default();
        tracing::info!(kind = event.kind(), payload = %payload, "audit event");
    }
}

fn render(event: &AuditEvent) -> String {
    match event {
        AuditEvent::ChallengeIssued {
            group_id,
            user_id,
            kind,
            attempt,
        } => format!(
            "🧩 Challenge ({}) sent to user {user_id} for group {group_id} (attempt {attempt})",
            kind.as_str()
        ),
        AuditEvent::ChallengeSolved { group_id, user_id } => {
            format!("✅ User {user_id} solved the challenge for group {group_id}")
        }
        AuditEvent::ChallengeFailed {
            group_id,
            user_id,
            reason,
        } => format!("❌ User {user_id} failed the challenge for group {group_id}: {reason}"),
        AuditEvent::ChallengeExpired { group_id, user_id } => {
            format!("⏰ Challenge for user {user_id} in group {group_id} expired")
        }
        AuditEvent::MemberApproved { group_id, user_id } => {
            format!("👤 User {user_id} approved into group {group_id}")
        }
        AuditEvent::MemberRejected { group_id, user_id } => {
            format!("🚷 User {user_id} rejected from group {group_id}")
        }
        AuditEvent::MemberMuted {
            group_id,
            user_id,
            until,
        } => match until {
            Some(ts) => format!("🔇 User {user_id} muted in group {group_id} until {ts}"),
            None => format!("🔇 User {user_id} muted in group {group_id} indefinitely"),
        },
        AuditEvent::ImageRemoved {
            group_id,
            user_id,
            reason,
            muted_until,
        } => {
            let until = match muted_until {
                Some(ts) => format!("until {ts}"),
                None => "indefinitely".to_string(),
            };
            format!(
                "🖼 Removed image from user {user_id} in group {group_id} ({reason}); muted {until}"
            )
        }
        AuditEvent::EnforcementPartial {
            group_id,
            user_id,
            deleted,
            restricted,
        } => format!(
            "⚠️ Partial enforcement for user {user_id} in group {group_id}: deleted={deleted} restricted={restricted}; reconcile manually"
        ),
    }
}
