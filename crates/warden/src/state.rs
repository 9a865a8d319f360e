//! Application state and shared resources.

use anyhow::{Context, Result};
use std::sync::Arc;

use gatehouse_common::GroupId;

use crate::admin::AdminRegistry;
use crate::admission::NewMemberMuter;
use crate::cache::{EphemeralCache, MemoryCache, RedisCache};
use crate::challenge::ChallengeEngine;
use crate::config::AppConfig;
use crate::coordinator::JoinCoordinator;
use crate::gateway::{PlatformEvent, PlatformGateway};
use crate::moderation::ModerationPipeline;
use crate::moderation::classifier::{DisabledAnalyzer, ImageAnalyzer, VisionClient};
use crate::notify::{ChannelSink, LogSink, NotificationSink};
use crate::policy::PolicyRepository;
use crate::ratelimit::RateLimiter;
use crate::store::Store;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: AppConfig,

    /// Durable store handle
    pub store: Arc<Store>,

    /// Ephemeral cache handle
    pub cache: Arc<dyn EphemeralCache>,

    /// Write-through policy repository
    pub policies: Arc<PolicyRepository>,

    /// Administrative authorization
    pub admins: Arc<AdminRegistry>,

    /// Join-request state machine
    pub coordinator: Arc<JoinCoordinator>,

    /// Image/caption moderation
    pub moderation: Arc<ModerationPipeline>,

    /// Mute-on-join handler
    pub muter: Arc<NewMemberMuter>,
}

impl AppState {
    /// Wire up all services. The gateway is an explicit dependency so the
    /// whole engine can run against a test double.
    pub async fn new(config: AppConfig, gateway: Arc<dyn PlatformGateway>) -> Result<Self> {
        let cache: Arc<dyn EphemeralCache> = match RedisCache::connect(&config.redis_url).await {
            Ok(redis) => Arc::new(redis),
            Err(e) => {
                // Degrade to a process-local map rather than refusing to
                // start; all TTL semantics are preserved.
                tracing::warn!(error = %e, "Redis unavailable, using in-process cache");
                Arc::new(MemoryCache::new())
            }
        };

        let store = Arc::new(
            Store::open(&config.db_path)
                .await
                .context("Failed to open the durable store")?,
        );

        let policies = Arc::new(PolicyRepository::new(store.clone(), cache.clone()));
        let admins = Arc::new(AdminRegistry::new(store.clone(), gateway.clone()));
        let limiter = RateLimiter::new(cache.clone());

        let sink: Arc<dyn NotificationSink> = match config.audit_channel_id {
            Some(channel) => Arc::new(ChannelSink::new(gateway.clone(), GroupId(channel))),
            None => Arc::new(LogSink),
        };

        let font = load_font(&config.challenge.font_path);
        let engine = ChallengeEngine::new(font, config.challenge.max_attempts);

        let analyzer: Arc<dyn ImageAnalyzer> = match (
            config.moderation.vision_endpoint.clone(),
            config.moderation.vision_api_key.clone(),
        ) {
            (Some(endpoint), Some(key)) => Arc::new(VisionClient::new(endpoint, key)),
            _ => {
                tracing::info!("No vision service configured, image checks limited to captions");
                Arc::new(DisabledAnalyzer)
            }
        };

        let coordinator = Arc::new(JoinCoordinator::new(
            policies.clone(),
            store.clone(),
            cache.clone(),
            gateway.clone(),
            limiter,
            sink.clone(),
            engine,
            config.challenge.clone(),
        ));

        let moderation = Arc::new(ModerationPipeline::new(
            policies.clone(),
            store.clone(),
            gateway.clone(),
            analyzer,
            sink.clone(),
            config.moderation.clone(),
        ));

        let muter = Arc::new(NewMemberMuter::new(
            policies.clone(),
            store.clone(),
            cache.clone(),
            gateway.clone(),
            sink,
        ));

        Ok(Self {
            config,
            store,
            cache,
            policies,
            admins,
            coordinator,
            moderation,
            muter,
        })
    }

    /// One event, one detached pipeline. Failures are converted to log
    /// entries at this boundary and never cross back into the ingress.
    pub fn dispatch(&self, event: PlatformEvent) {
        let state = self.clone();
        tokio::spawn(async move {
            let result = match event {
                PlatformEvent::JoinRequest {
                    group_id,
                    user_id,
                    user_display,
                } => {
                    state
                        .coordinator
                        .handle_join_request(group_id, user_id, &user_display)
                        .await
                }
                PlatformEvent::AnswerSubmitted { token, user_id } => {
                    state.coordinator.handle_answer(&token, user_id).await
                }
                PlatformEvent::TextMessage { user_id, text } => {
                    state.coordinator.handle_text_answer(user_id, &text).await
                }
                PlatformEvent::ImageMessage {
                    group_id,
                    user_id,
                    message,
                    caption,
                    image_ref,
                } => {
                    state
                        .moderation
                        .handle_image_message(
                            group_id,
                            user_id,
                            message,
                            caption.as_deref(),
                            &image_ref,
                        )
                        .await
                }
                PlatformEvent::MembershipChange {
                    group_id,
                    user_id,
                    old_status,
                    new_status,
                } => {
                    state
                        .muter
                        .handle_membership_change(group_id, user_id, old_status, new_status)
                        .await
                }
            };

            if let Err(e) = result {
                tracing::error!(error = %e, "Event pipeline failed");
            }
        });
    }

    /// Dependency probe for the readiness endpoint.
    pub async fn ready(&self) -> (bool, bool) {
        let cache_ok = self.cache.exists("warden:ready-probe").await.is_ok();
        let store_ok = self
            .store
            .call(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
            .await
            .is_ok();
        (cache_ok, store_ok)
    }
}

fn load_font(path: &str) -> Option<ab_glyph::FontArc> {
    match std::fs::read(path) {
        Ok(bytes) => match ab_glyph::FontArc::try_from_vec(bytes) {
            Ok(font) => Some(font),
            Err(e) => {
                tracing::warn!(path, error = %e, "Challenge font unusable, visual challenges degrade to arithmetic");
                None
            }
        },
        Err(e) => {
            tracing::warn!(path, error = %e, "Challenge font not readable, visual challenges degrade to arithmetic");
            None
        }
    }
}
