//! Platform gateway: the capability interface through which the engine talks
//! to the chat platform, plus the inbound event schema the platform (or its
//! adapter) delivers to us.
//!
//! The engine never holds a global client handle; coordinators and pipelines
//! receive an `Arc<dyn PlatformGateway>` at construction.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use gatehouse_common::{
    ChatInfo, ChatRef, GroupId, MemberStatus, MessageRef, UserId, WardenError,
};

/// One interactive option attached to a message. The token is opaque; the
/// answer itself never travels through it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerOption {
    pub label: String,
    pub token: String,
}

/// Options accompanying an outbound message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<AnswerOption>,
}

impl SendOptions {
    pub fn with_options(options: Vec<AnswerOption>) -> Self {
        Self { options }
    }
}

/// Permission set applied by `restrict_member`. Everything absent from the
/// set is denied for the duration of the restriction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberPermissions {
    pub can_send_messages: bool,
    pub can_send_media: bool,
    pub can_invite_users: bool,
}

impl MemberPermissions {
    /// The "no further messages" mute.
    pub fn muted() -> Self {
        Self {
            can_send_messages: false,
            can_send_media: false,
            can_invite_users: false,
        }
    }
}

/// Outbound commands accepted by the chat platform.
///
/// Any call may fail with [`WardenError::Gateway`]; callers on the decision
/// path catch, log, and degrade rather than abort (see the coordinator and
/// the moderation pipeline for the per-call policy).
#[async_trait]
pub trait PlatformGateway: Send + Sync {
    async fn send_message(
        &self,
        target: ChatRef,
        text: &str,
        options: SendOptions,
    ) -> Result<MessageRef, WardenError>;

    async fn edit_message(
        &self,
        message: MessageRef,
        text: &str,
        options: SendOptions,
    ) -> Result<(), WardenError>;

    async fn delete_message(&self, message: MessageRef) -> Result<(), WardenError>;

    async fn send_photo(
        &self,
        target: ChatRef,
        png: Vec<u8>,
        caption: &str,
    ) -> Result<MessageRef, WardenError>;

    async fn approve_join_request(&self, group: GroupId, user: UserId)
    -> Result<(), WardenError>;

    async fn restrict_member(
        &self,
        group: GroupId,
        user: UserId,
        permissions: MemberPermissions,
        until: Option<i64>,
    ) -> Result<(), WardenError>;

    async fn get_chat_info(&self, group: GroupId) -> Result<ChatInfo, WardenError>;

    async fn get_chat_member(
        &self,
        group: GroupId,
        user: UserId,
    ) -> Result<MemberStatus, WardenError>;

    /// Download the raw bytes behind an image reference.
    async fn fetch_image(&self, image_ref: &str) -> Result<Vec<u8>, WardenError>;
}

/// Whether a gateway failure is the harmless "message already gone" case.
/// Deleting an already-deleted message is suppressed, not retried.
pub fn is_message_missing(err: &WardenError) -> bool {
    matches!(err, WardenError::Gateway(detail) if detail.to_lowercase().contains("not found"))
}

/// Inbound platform events, delivered by the platform adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlatformEvent {
    JoinRequest {
        group_id: GroupId,
        user_id: UserId,
        user_display: String,
    },
    /// An option button was pressed; the token correlates it back to a
    /// challenge without exposing the answer.
    AnswerSubmitted { token: String, user_id: UserId },
    /// A plain text message in the user's direct chat; only meaningful while
    /// a typed-answer challenge is pending for that user.
    TextMessage { user_id: UserId, text: String },
    ImageMessage {
        group_id: GroupId,
        user_id: UserId,
        message: MessageRef,
        caption: Option<String>,
        image_ref: String,
    },
    MembershipChange {
        group_id: GroupId,
        user_id: UserId,
        old_status: MemberStatus,
        new_status: MemberStatus,
    },
}

/// Gateway implementation speaking to a platform adapter ("relay") over
/// HTTP. The relay owns the chat platform's wire format; we only ever see
/// this neutral command schema.
pub struct RelayGateway {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct SendMessageBody<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    options: Vec<AnswerOption>,
}

#[derive(Deserialize)]
struct MessageIdResponse {
    message_id: i64,
}

impl RelayGateway {
    pub fn new(base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        command: &str,
        body: &B,
    ) -> Result<T, WardenError> {
        let url = format!("{}/commands/{}", self.base_url, command);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| WardenError::Gateway(format!("{command}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(WardenError::Gateway(format!("{command}: {status}: {detail}")));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| WardenError::Gateway(format!("{command}: bad response: {e}")))
    }
}

#[async_trait]
impl PlatformGateway for RelayGateway {
    async fn send_message(
        &self,
        target: ChatRef,
        text: &str,
        options: SendOptions,
    ) -> Result<MessageRef, WardenError> {
        let body = SendMessageBody {
            chat_id: target.id(),
            text,
            options: options.options,
        };
        let reply: MessageIdResponse = self.post("send_message", &body).await?;
        Ok(MessageRef {
            chat_id: target.id(),
            message_id: reply.message_id,
        })
    }

    async fn edit_message(
        &self,
        message: MessageRef,
        text: &str,
        options: SendOptions,
    ) -> Result<(), WardenError> {
        let body = serde_json::json!({
            "chat_id": message.chat_id,
            "message_id": message.message_id,
            "text": text,
            "options": options.options,
        });
        let _: serde_json::Value = self.post("edit_message", &body).await?;
        Ok(())
    }

    async fn delete_message(&self, message: MessageRef) -> Result<(), WardenError> {
        let body = serde_json::json!({
            "chat_id": message.chat_id,
            "message_id": message.message_id,
        });
        let _: serde_json::Value = self.post("delete_message", &body).await?;
        Ok(())
    }

    async fn send_photo(
        &self,
        target: ChatRef,
        png: Vec<u8>,
        caption: &str,
    ) -> Result<MessageRef, WardenError> {
        use base64::Engine;
        let body = serde_json::json!({
            "chat_id": target.id(),
            "caption": caption,
            "png_base64": base64::engine::general_purpose::STANDARD.encode(&png),
        });
        let reply: MessageIdResponse = self.post("send_photo", &body).await?;
        Ok(MessageRef {
            chat_id: target.id(),
            message_id: reply.message_id,
        })
    }

    async fn approve_join_request(
        &self,
        group: GroupId,
        user: UserId,
    ) -> Result<(), WardenError> {
        let body = serde_json::json!({ "group_id": group, "user_id": user });
        let _: serde_json::Value = self.post("approve_join_request", &body).await?;
        Ok(())
    }

    async fn restrict_member(
        &self,
        group: GroupId,
        user: UserId,
        permissions: MemberPermissions,
        until: Option<i64>,
    ) -> Result<(), WardenError> {
        let body = serde_json::json!({
            "group_id": group,
            "user_id": user,
            "permissions": permissions,
            "until": until,
        });
        let _: serde_json::Value = self.post("restrict_member", &body).await?;
        Ok(())
    }

    async fn get_chat_info(&self, group: GroupId) -> Result<ChatInfo, WardenError> {
        let body = serde_json::json!({ "group_id": group });
        self.post("get_chat_info", &body).await
    }

    async fn get_chat_member(
        &self,
        group: GroupId,
        user: UserId,
    ) -> Result<MemberStatus, WardenError> {
        #[derive(Deserialize)]
        struct StatusResponse {
            status: MemberStatus,
        }
        let body = serde_json::json!({ "group_id": group, "user_id": user });
        let reply: StatusResponse = self.post("get_chat_member", &body).await?;
        Ok(reply.status)
    }

    async fn fetch_image(&self, image_ref: &str) -> Result<Vec<u8>, WardenError> {
        let url = format!("{}/files/{}", self.base_url, image_ref);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| WardenError::Gateway(format!("fetch_image: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WardenError::Gateway(format!("fetch_image: {status}")));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| WardenError::Gateway(format!("fetch_image: {e}")))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording gateway double used by the coordinator and pipeline tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

    #[derive(Debug, Clone)]
    pub enum Call {
        SendMessage {
            target: ChatRef,
            text: String,
            options: Vec<AnswerOption>,
        },
        EditMessage {
            message: MessageRef,
            text: String,
            options: Vec<AnswerOption>,
        },
        DeleteMessage(MessageRef),
        SendPhoto {
            target: ChatRef,
            caption: String,
        },
        Approve(GroupId, UserId),
        Restrict {
            group: GroupId,
            user: UserId,
            until: Option<i64>,
        },
    }

    #[derive(Default)]
    pub struct RecordingGateway {
        pub calls: Mutex<Vec<Call>>,
        next_message_id: AtomicI64,
        pub fail_approve: AtomicBool,
        pub fail_delete_with: Mutex<Option<String>>,
        pub fail_restrict: AtomicBool,
        pub member_statuses: Mutex<HashMap<(GroupId, UserId), MemberStatus>>,
    }

    impl RecordingGateway {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn recorded(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn approvals(&self) -> usize {
            self.recorded()
                .iter()
                .filter(|c| matches!(c, Call::Approve(..)))
                .count()
        }

        pub fn deletions(&self) -> usize {
            self.recorded()
                .iter()
                .filter(|c| matches!(c, Call::DeleteMessage(..)))
                .count()
        }

        pub fn restrictions(&self) -> Vec<(GroupId, UserId, Option<i64>)> {
            self.recorded()
                .iter()
                .filter_map(|c| match c {
                    Call::Restrict { group, user, until } => Some((*group, *user, *until)),
                    _ => None,
                })
                .collect()
        }

        pub fn sent_texts(&self) -> Vec<String> {
            self.recorded()
                .iter()
                .filter_map(|c| match c {
                    Call::SendMessage { text, .. } => Some(text.clone()),
                    _ => None,
                })
                .collect()
        }

        /// Options attached to the most recent message that carried any.
        pub fn last_options(&self) -> Option<Vec<AnswerOption>> {
            self.recorded()
                .iter()
                .rev()
                .find_map(|c| match c {
                    Call::SendMessage { options, .. } | Call::EditMessage { options, .. }
                        if !options.is_empty() =>
                    {
                        Some(options.clone())
                    }
                    _ => None,
                })
        }

        pub fn set_member_status(&self, group: GroupId, user: UserId, status: MemberStatus) {
            self.member_statuses
                .lock()
                .unwrap()
                .insert((group, user), status);
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }

        fn next_ref(&self, chat_id: i64) -> MessageRef {
            MessageRef {
                chat_id,
                message_id: self.next_message_id.fetch_add(1, Ordering::SeqCst) + 1,
            }
        }
    }

    #[async_trait]
    impl PlatformGateway for RecordingGateway {
        async fn send_message(
            &self,
            target: ChatRef,
            text: &str,
            options: SendOptions,
        ) -> Result<MessageRef, WardenError> {
            self.record(Call::SendMessage {
                target,
                text: text.to_string(),
                options: options.options,
            });
            Ok(self.next_ref(target.id()))
        }

        async fn edit_message(
            &self,
            message: MessageRef,
            text: &str,
            options: SendOptions,
        ) -> Result<(), WardenError> {
            self.record(Call::EditMessage {
                message,
                text: text.to_string(),
                options: options.options,
            });
            Ok(())
        }

        async fn delete_message(&self, message: MessageRef) -> Result<(), WardenError> {
            if let Some(detail) = self.fail_delete_with.lock().unwrap().clone() {
                return Err(WardenError::Gateway(detail));
            }
            self.record(Call::DeleteMessage(message));
            Ok(())
        }

        async fn send_photo(
            &self,
            target: ChatRef,
            _png: Vec<u8>,
            caption: &str,
        ) -> Result<MessageRef, WardenError> {
            self.record(Call::SendPhoto {
                target,
                caption: caption.to_string(),
            });
            Ok(self.next_ref(target.id()))
        }

        async fn approve_join_request(
            &self,
            group: GroupId,
            user: UserId,
        ) -> Result<(), WardenError> {
            if self.fail_approve.load(Ordering::SeqCst) {
                return Err(WardenError::Gateway("approve_join_request: 502".into()));
            }
            self.record(Call::Approve(group, user));
            Ok(())
        }

        async fn restrict_member(
            &self,
            group: GroupId,
            user: UserId,
            _permissions: MemberPermissions,
            until: Option<i64>,
        ) -> Result<(), WardenError> {
            if self.fail_restrict.load(Ordering::SeqCst) {
                return Err(WardenError::Gateway("restrict_member: 502".into()));
            }
            self.record(Call::Restrict { group, user, until });
            Ok(())
        }

        async fn get_chat_info(&self, _group: GroupId) -> Result<ChatInfo, WardenError> {
            Ok(ChatInfo {
                title: "Test Group".to_string(),
                public_handle: None,
            })
        }

        async fn get_chat_member(
            &self,
            group: GroupId,
            user: UserId,
        ) -> Result<MemberStatus, WardenError> {
            Ok(self
                .member_statuses
                .lock()
                .unwrap()
                .get(&(group, user))
                .copied()
                .unwrap_or(MemberStatus::Member))
        }

        async fn fetch_image(&self, _image_ref: &str) -> Result<Vec<u8>, WardenError> {
            Ok(vec![0u8; 4])
        }
    }
}
