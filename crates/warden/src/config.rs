//! Configuration management for Warden.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use gatehouse_common::constants::{
    ANSWER_COOLDOWN_SECS, ARITHMETIC_CHALLENGE_TTL_SECS, DEFAULT_DB_PATH, DEFAULT_LISTEN_ADDR,
    DEFAULT_REDIS_URL, DEFAULT_TAG_CONFIDENCE, MAX_CHALLENGE_ATTEMPTS,
    VIOLATION_NOTICE_DELETE_SECS, VISUAL_CHALLENGE_TTL_SECS,
};

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Sqlite database path
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Base URL of the platform adapter that executes our commands
    #[serde(default = "default_relay_url")]
    pub relay_url: String,

    /// Administrative channel receiving audit events (none = process log only)
    #[serde(default)]
    pub audit_channel_id: Option<i64>,

    /// Challenge configuration
    #[serde(default)]
    pub challenge: ChallengeSettings,

    /// Moderation configuration
    #[serde(default)]
    pub moderation: ModerationSettings,
}

/// Challenge-specific configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ChallengeSettings {
    /// Option-button challenge validity in seconds
    #[serde(default = "default_arithmetic_ttl")]
    pub arithmetic_ttl_secs: u64,

    /// Typed-answer challenge validity in seconds
    #[serde(default = "default_visual_ttl")]
    pub visual_ttl_secs: u64,

    /// Incorrect answers allowed per request
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Cool-down after the budget is spent, in seconds
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// Path to the font used for visual challenges
    #[serde(default = "default_font_path")]
    pub font_path: String,
}

impl Default for ChallengeSettings {
    fn default() -> Self {
        Self {
            arithmetic_ttl_secs: default_arithmetic_ttl(),
            visual_ttl_secs: default_visual_ttl(),
            max_attempts: default_max_attempts(),
            cooldown_secs: default_cooldown(),
            font_path: default_font_path(),
        }
    }
}

/// Moderation-specific configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ModerationSettings {
    /// Minimum classifier confidence for a forbidden-tag match
    #[serde(default = "default_tag_confidence")]
    pub tag_confidence_threshold: f32,

    /// How long in-group notices stay up, in seconds
    #[serde(default = "default_notice_delete")]
    pub notice_delete_secs: u64,

    /// Vision service endpoint (none = caption checks only)
    #[serde(default)]
    pub vision_endpoint: Option<String>,

    /// Vision service API key
    #[serde(default)]
    pub vision_api_key: Option<String>,
}

impl Default for ModerationSettings {
    fn default() -> Self {
        Self {
            tag_confidence_threshold: default_tag_confidence(),
            notice_delete_secs: default_notice_delete(),
            vision_endpoint: None,
            vision_api_key: None,
        }
    }
}

// Default value functions
fn default_redis_url() -> String { DEFAULT_REDIS_URL.to_string() }
fn default_db_path() -> String { DEFAULT_DB_PATH.to_string() }
fn default_listen_addr() -> String { DEFAULT_LISTEN_ADDR.to_string() }
fn default_relay_url() -> String { "http://127.0.0.1:8090".to_string() }
fn default_arithmetic_ttl() -> u64 { ARITHMETIC_CHALLENGE_TTL_SECS }
fn default_visual_ttl() -> u64 { VISUAL_CHALLENGE_TTL_SECS }
fn default_max_attempts() -> u32 { MAX_CHALLENGE_ATTEMPTS }
fn default_cooldown() -> u64 { ANSWER_COOLDOWN_SECS }
fn default_font_path() -> String { "assets/fonts/DejaVuSans.ttf".to_string() }
fn default_tag_confidence() -> f32 { DEFAULT_TAG_CONFIDENCE }
fn default_notice_delete() -> u64 { VIOLATION_NOTICE_DELETE_SECS }

impl AppConfig {
    /// Load configuration from file, with CLI overrides
    pub fn load(config_path: &str, args: &super::Args) -> Result<Self> {
        let mut config = if Path::new(config_path).exists() {
            let settings = config::Config::builder()
                .add_source(config::File::with_name(config_path))
                .build()
                .context("Failed to load config file")?;

            settings
                .try_deserialize()
                .context("Failed to parse config")?
        } else {
            // Use defaults if config file doesn't exist
            tracing::warn!("Config file not found, using defaults");
            Self::default()
        };

        // Apply CLI overrides
        if let Some(ref redis_url) = args.redis_url {
            config.redis_url = redis_url.clone();
        }
        if let Some(ref listen) = args.listen {
            config.listen_addr = listen.clone();
        }
        if let Some(ref relay_url) = args.relay_url {
            config.relay_url = relay_url.clone();
        }
        if let Some(ref db_path) = args.db_path {
            config.db_path = db_path.clone();
        }

        Ok(config)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            db_path: default_db_path(),
            listen_addr: default_listen_addr(),
            relay_url: default_relay_url(),
            audit_channel_id: None,
            challenge: ChallengeSettings::default(),
            moderation: ModerationSettings::default(),
        }
    }
}
