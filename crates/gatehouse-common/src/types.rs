//! Core types shared across Gatehouse components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a group conversation on the chat platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub i64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for GroupId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Identifier of a platform user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for UserId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Destination of an outbound message: a group conversation or a user's
/// direct-message chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRef {
    Group(GroupId),
    User(UserId),
}

impl ChatRef {
    /// Raw platform chat id behind this reference.
    pub fn id(&self) -> i64 {
        match self {
            Self::Group(g) => g.0,
            Self::User(u) => u.0,
        }
    }
}

/// Handle to a message the platform has already delivered or accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i64,
}

/// Chat metadata returned by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatInfo {
    pub title: String,
    /// Public handle ("@name") if the group has one; private groups have none.
    pub public_handle: Option<String>,
}

/// Membership status of a user within a group, as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Creator,
    Administrator,
    Member,
    Restricted,
    Left,
    Kicked,
}

impl MemberStatus {
    /// Whether this status carries administrative rights.
    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Creator | Self::Administrator)
    }
}

/// The two challenge flavors the engine can issue.
///
/// - `Arithmetic`: an option-button puzzle answered by pressing one of four
///   correlated buttons. Short TTL.
/// - `Visual`: a distorted-image puzzle answered by typing the text. Longer
///   TTL since the user has to read and type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeKind {
    Arithmetic,
    Visual,
}

impl ChallengeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Arithmetic => "arithmetic",
            Self::Visual => "visual",
        }
    }

    /// Default challenge validity for this kind, in seconds.
    pub fn default_ttl_secs(&self) -> u64 {
        match self {
            Self::Arithmetic => crate::constants::ARITHMETIC_CHALLENGE_TTL_SECS,
            Self::Visual => crate::constants::VISUAL_CHALLENGE_TTL_SECS,
        }
    }
}

impl std::str::FromStr for ChallengeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "arithmetic" => Ok(Self::Arithmetic),
            "visual" => Ok(Self::Visual),
            other => Err(format!("unknown challenge kind: {other}")),
        }
    }
}

/// Lifecycle of a membership request.
///
/// `Approved`, `Rejected` and `Expired` are absorbing: once reached, the only
/// way forward is a fresh request superseding the old row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    ChallengeIssued,
    Approved,
    Rejected,
    Expired,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::ChallengeIssued => "challenge_issued",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "challenge_issued" => Ok(Self::ChallengeIssued),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown request status: {other}")),
        }
    }
}

/// Outcome of verifying a submitted answer against a stored challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Correct,
    Incorrect,
    /// The challenge's deadline has passed; comparison result is irrelevant.
    Expired,
    /// The attempt budget is spent; the caller must apply a cool-down instead
    /// of handing out further `Incorrect` verdicts.
    Exhausted,
}

/// Per-group feature configuration.
///
/// Authoritative copy lives in the durable store; a denormalized copy is held
/// in the ephemeral cache for hot reads. Created lazily with everything
/// disabled the first time a group is referenced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupPolicy {
    /// Screen join requests with a challenge.
    pub challenge_enabled: bool,
    /// Which challenge flavor to issue.
    pub challenge_kind: ChallengeKind,
    /// Deliver the challenge via direct message rather than in the group.
    pub challenge_in_pm: bool,
    /// Auto-mute members admitted by hand rather than through a challenge.
    pub mute_new_members: bool,
    /// Duration of the mute-on-join restriction. 0 means unbounded.
    pub mute_duration_secs: i64,
    /// Inspect posted images/captions for disallowed content.
    pub photo_filter_enabled: bool,
    /// Mute length applied on a photo-filter violation. 0 means unbounded.
    pub photo_filter_mute_minutes: i64,
    /// Administrators' photos skip the filter.
    pub admins_bypass_photo_filter: bool,
}

impl Default for GroupPolicy {
    fn default() -> Self {
        Self {
            challenge_enabled: false,
            challenge_kind: ChallengeKind::Arithmetic,
            challenge_in_pm: true,
            mute_new_members: false,
            mute_duration_secs: 0,
            photo_filter_enabled: false,
            photo_filter_mute_minutes: crate::constants::DEFAULT_PHOTO_MUTE_MINUTES,
            admins_bypass_photo_filter: true,
        }
    }
}

/// Partial update applied to a [`GroupPolicy`]. Absent fields keep their
/// current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_kind: Option<ChallengeKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_in_pm: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mute_new_members: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mute_duration_secs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_filter_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_filter_mute_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admins_bypass_photo_filter: Option<bool>,
}

impl PolicyPatch {
    /// Apply this patch on top of `policy`.
    pub fn apply(&self, policy: &mut GroupPolicy) {
        if let Some(v) = self.challenge_enabled {
            policy.challenge_enabled = v;
        }
        if let Some(v) = self.challenge_kind {
            policy.challenge_kind = v;
        }
        if let Some(v) = self.challenge_in_pm {
            policy.challenge_in_pm = v;
        }
        if let Some(v) = self.mute_new_members {
            policy.mute_new_members = v;
        }
        if let Some(v) = self.mute_duration_secs {
            policy.mute_duration_secs = v;
        }
        if let Some(v) = self.photo_filter_enabled {
            policy.photo_filter_enabled = v;
        }
        if let Some(v) = self.photo_filter_mute_minutes {
            policy.photo_filter_mute_minutes = v;
        }
        if let Some(v) = self.admins_bypass_photo_filter {
            policy.admins_bypass_photo_filter = v;
        }
    }
}

/// One pending or resolved request to join a group.
///
/// At most one row per (group, user) pair; a new join request after a
/// terminal status starts over on the same row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipRequest {
    pub group_id: GroupId,
    pub user_id: UserId,
    pub status: RequestStatus,
    /// Unix timestamp of the request's arrival.
    pub requested_at: i64,
    /// Unix timestamp of the terminal transition, if any.
    pub resolved_at: Option<i64>,
    /// The live challenge message, if one is on screen.
    pub challenge_message: Option<MessageRef>,
    /// A "time expired" notice from an earlier attempt, removed on re-request.
    pub timeout_notice: Option<MessageRef>,
}

/// Kind of restriction applied to a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestrictionType {
    Mute,
}

impl RestrictionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mute => "mute",
        }
    }
}

/// Append-only audit record of an applied restriction. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestrictionRecord {
    pub group_id: GroupId,
    pub user_id: UserId,
    pub kind: RestrictionType,
    pub reason: String,
    pub created_at: i64,
    /// Unix timestamp the restriction lapses; `None` for unbounded mutes.
    pub expires_at: Option<i64>,
}

/// Structured events delivered to the notification sink.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    ChallengeIssued {
        group_id: GroupId,
        user_id: UserId,
        kind: ChallengeKind,
        attempt: u32,
    },
    ChallengeSolved {
        group_id: GroupId,
        user_id: UserId,
    },
    ChallengeFailed {
        group_id: GroupId,
        user_id: UserId,
        reason: String,
    },
    ChallengeExpired {
        group_id: GroupId,
        user_id: UserId,
    },
    MemberApproved {
        group_id: GroupId,
        user_id: UserId,
    },
    MemberRejected {
        group_id: GroupId,
        user_id: UserId,
    },
    MemberMuted {
        group_id: GroupId,
        user_id: UserId,
        until: Option<i64>,
    },
    ImageRemoved {
        group_id: GroupId,
        user_id: UserId,
        reason: String,
        muted_until: Option<i64>,
    },
    /// Delete and restrict are independent platform calls; when exactly one
    /// of them failed operators need to reconcile by hand.
    EnforcementPartial {
        group_id: GroupId,
        user_id: UserId,
        deleted: bool,
        restricted: bool,
    },
}

impl AuditEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChallengeIssued { .. } => "challenge_issued",
            Self::ChallengeSolved { .. } => "challenge_solved",
            Self::ChallengeFailed { .. } => "challenge_failed",
            Self::ChallengeExpired { .. } => "challenge_expired",
            Self::MemberApproved { .. } => "member_approved",
            Self::MemberRejected { .. } => "member_rejected",
            Self::MemberMuted { .. } => "member_muted",
            Self::ImageRemoved { .. } => "image_removed",
            Self::EnforcementPartial { .. } => "enforcement_partial",
        }
    }
}
