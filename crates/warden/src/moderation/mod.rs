//! Content-moderation pipeline for posted images.
//!
//! Inspection order: caption denylist first (cheap, local), then the image
//! classifier, then OCR text re-checked against the denylist, short-circuiting
//! on the first hit. Enforcement deletes the message and applies a
//! time-bounded mute with exactly one decision per message; deletion and
//! restriction are independent platform calls, so a partial failure is logged
//! distinctly for manual reconciliation and never retried.

pub mod classifier;
mod denylist;

use std::sync::Arc;
use std::time::Duration;

use gatehouse_common::{
    AuditEvent, ChatRef, GroupId, GroupPolicy, MessageRef, RestrictionRecord, RestrictionType,
    UserId, WardenError,
};

use crate::config::ModerationSettings;
use crate::gateway::{MemberPermissions, PlatformGateway, SendOptions, is_message_missing};
use crate::notify::NotificationSink;
use crate::policy::PolicyRepository;
use crate::store::Store;
use crate::tasks;
use classifier::ImageAnalyzer;

/// Outcome of inspecting a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inspection {
    Clean,
    Violation(String),
}

pub struct ModerationPipeline {
    policies: Arc<PolicyRepository>,
    store: Arc<Store>,
    gateway: Arc<dyn PlatformGateway>,
    analyzer: Arc<dyn ImageAnalyzer>,
    sink: Arc<dyn NotificationSink>,
    settings: ModerationSettings,
}

impl ModerationPipeline {
    pub fn new(
        policies: Arc<PolicyRepository>,
        store: Arc<Store>,
        gateway: Arc<dyn PlatformGateway>,
        analyzer: Arc<dyn ImageAnalyzer>,
        sink: Arc<dyn NotificationSink>,
        settings: ModerationSettings,
    ) -> Self {
        Self {
            policies,
            store,
            gateway,
            analyzer,
            sink,
            settings,
        }
    }

    pub async fn handle_image_message(
        &self,
        group: GroupId,
        user: UserId,
        message: MessageRef,
        caption: Option<&str>,
        image_ref: &str,
    ) -> Result<(), WardenError> {
        let policy = self.policies.get(group).await?;
        if !policy.photo_filter_enabled {
            return Ok(());
        }

        if policy.admins_bypass_photo_filter {
            match self.gateway.get_chat_member(group, user).await {
                Ok(status) if status.is_admin() => {
                    tracing::debug!(group_id = %group, user_id = %user, "Administrator photo, filter bypassed");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    // Unknown status is treated as a regular member.
                    tracing::warn!(group_id = %group, user_id = %user, error = %e, "Member status lookup failed");
                }
            }
        }

        match self.inspect(caption, image_ref).await {
            Inspection::Clean => Ok(()),
            Inspection::Violation(reason) => {
                self.enforce(group, user, message, &reason, &policy).await
            }
        }
    }

    /// Run the sub-checks in cost order. Classifier and OCR failures are
    /// logged and count as "nothing found by that sub-check".
    pub async fn inspect(&self, caption: Option<&str>, image_ref: &str) -> Inspection {
        if let Some(caption) = caption {
            if let Some(term) = denylist::find_term(caption) {
                return Inspection::Violation(format!("forbidden term in caption: {term}"));
            }
        }

        let image = match self.gateway.fetch_image(image_ref).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(image_ref, error = %e, "Image download failed, skipping image checks");
                return Inspection::Clean;
            }
        };

        match self.analyzer.classify_image(&image).await {
            Ok(tags) => {
                for tag in tags {
                    if tag.confidence > self.settings.tag_confidence_threshold {
                        if let Some(matched) = denylist::matching_tag(&tag.name) {
                            return Inspection::Violation(format!(
                                "forbidden image content: {} (tag {matched}, confidence {:.2})",
                                tag.name, tag.confidence
                            ));
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Image classification failed, skipping");
            }
        }

        match self.analyzer.extract_text(&image).await {
            Ok(text) if !text.is_empty() => {
                if let Some(term) = denylist::find_term(&text) {
                    return Inspection::Violation(format!("forbidden term in image text: {term}"));
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "OCR failed, skipping");
            }
        }

        Inspection::Clean
    }

    async fn enforce(
        &self,
        group: GroupId,
        user: UserId,
        message: MessageRef,
        reason: &str,
        policy: &GroupPolicy,
    ) -> Result<(), WardenError> {
        let deleted = match self.gateway.delete_message(message).await {
            Ok(()) => true,
            // Already gone is success, not a retry candidate.
            Err(e) if is_message_missing(&e) => true,
            Err(e) => {
                tracing::warn!(group_id = %group, user_id = %user, error = %e, "Violating message deletion failed");
                false
            }
        };

        let now = chrono::Utc::now().timestamp();
        let until = if policy.photo_filter_mute_minutes == 0 {
            None
        } else {
            Some(now + policy.photo_filter_mute_minutes * 60)
        };

        let restricted = match self
            .gateway
            .restrict_member(group, user, MemberPermissions::muted(), until)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(group_id = %group, user_id = %user, error = %e, "Restriction call failed");
                false
            }
        };

        if deleted != restricted {
            self.sink
                .emit(&AuditEvent::EnforcementPartial {
                    group_id: group,
                    user_id: user,
                    deleted,
                    restricted,
                })
                .await;
        }

        if restricted {
            if let Err(e) = self
                .store
                .append_restriction(RestrictionRecord {
                    group_id: group,
                    user_id: user,
                    kind: RestrictionType::Mute,
                    reason: reason.to_string(),
                    created_at: now,
                    expires_at: until,
                })
                .await
            {
                tracing::error!(group_id = %group, user_id = %user, error = %e, "Restriction record write failed");
            }
        }

        self.sink
            .emit(&AuditEvent::ImageRemoved {
                group_id: group,
                user_id: user,
                reason: reason.to_string(),
                muted_until: until,
            })
            .await;

        let mute_text = if policy.photo_filter_mute_minutes == 0 {
            "indefinitely".to_string()
        } else {
            format!("for {} minutes", policy.photo_filter_mute_minutes)
        };
        if let Ok(notice) = self
            .gateway
            .send_message(
                ChatRef::Group(group),
                &format!("❌ A photo from user {user} was removed.\n🔇 Muted {mute_text}."),
                SendOptions::default(),
            )
            .await
        {
            tasks::delete_after(
                self.gateway.clone(),
                notice,
                Duration::from_secs(self.settings.notice_delete_secs),
            );
        }

        tracing::info!(
            group_id = %group,
            user_id = %user,
            reason,
            deleted,
            restricted,
            "Image violation enforced"
        );
        Ok(())
    }
}
