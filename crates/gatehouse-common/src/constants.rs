//! Shared constants for Gatehouse components.

/// Default Redis connection URL
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Default sqlite database path
pub const DEFAULT_DB_PATH: &str = "warden.sqlite";

/// Default Warden HTTP listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8484";

/// Option-button (arithmetic) challenge expiry (70 seconds)
pub const ARITHMETIC_CHALLENGE_TTL_SECS: u64 = 70;

/// Typed-answer (visual) challenge expiry (3 minutes)
pub const VISUAL_CHALLENGE_TTL_SECS: u64 = 180;

/// Cumulative incorrect answers allowed per membership request
pub const MAX_CHALLENGE_ATTEMPTS: u32 = 3;

/// Cool-down applied after the attempt budget is spent (1 minute)
pub const ANSWER_COOLDOWN_SECS: u64 = 60;

/// Lifetime of the "approved by the coordinator" marker used to tell
/// challenge-approved members apart from manually-admitted ones
pub const APPROVAL_MARKER_TTL_SECS: u64 = 60;

/// How long in-group moderation notices stay on screen before auto-deletion
pub const VIOLATION_NOTICE_DELETE_SECS: u64 = 30;

/// How long "please wait" notices stay on screen
pub const WAIT_NOTICE_DELETE_SECS: u64 = 5;

/// Minimum classifier confidence for a forbidden-tag match
pub const DEFAULT_TAG_CONFIDENCE: f32 = 0.7;

/// Default mute length for photo-filter violations, in minutes
pub const DEFAULT_PHOTO_MUTE_MINUTES: i64 = 60;

/// Ephemeral cache key builders.
///
/// Every entry written under these keys carries a TTL; nothing here is
/// expected to outlive its window.
pub mod cache_keys {
    use crate::types::{GroupId, UserId};

    /// Denormalized group policy: policy:{group_id}
    pub fn policy(group: GroupId) -> String {
        format!("policy:{group}")
    }

    /// Live challenge state: challenge:{group_id}:{user_id}
    pub fn challenge(group: GroupId, user: UserId) -> String {
        format!("challenge:{group}:{user}")
    }

    /// Group a user's pending typed-answer challenge belongs to:
    /// pending:{user_id}
    pub fn pending_group(user: UserId) -> String {
        format!("pending:{user}")
    }

    /// Correlation token payload: token:{token}
    pub fn answer_token(token: &str) -> String {
        format!("token:{token}")
    }

    /// Cool-down marker: ratelimit:{user_id}
    pub fn rate_limit(user: UserId) -> String {
        format!("ratelimit:{user}")
    }

    /// Coordinator-approved marker: approved:{group_id}:{user_id}
    pub fn approval_marker(group: GroupId, user: UserId) -> String {
        format!("approved:{group}:{user}")
    }
}
