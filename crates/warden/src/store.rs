//! Durable store backed by sqlite.
//!
//! All access goes through [`Store::call`], which runs the closure on the
//! blocking pool (rusqlite connections are not `Send`-friendly across await
//! points). The schema is created idempotently at startup.
//!
//! `membership_requests` keeps one row per (group, user); terminal-state
//! exclusivity is enforced with a compare-and-set UPDATE on `status`.
//! `challenges` and `restrictions` are append-only audit tables.

use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use tokio::task;

use gatehouse_common::{
    ChallengeKind, GroupId, GroupPolicy, MembershipRequest, MessageRef, PolicyPatch,
    RequestStatus, RestrictionRecord, RestrictionType, UserId, WardenError,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS groups (
  group_id INTEGER PRIMARY KEY,
  title TEXT NOT NULL,
  creator_user_id INTEGER,
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS group_policies (
  group_id INTEGER PRIMARY KEY,
  challenge_enabled INTEGER NOT NULL DEFAULT 0,
  challenge_kind TEXT NOT NULL DEFAULT 'arithmetic',
  challenge_in_pm INTEGER NOT NULL DEFAULT 1,
  mute_new_members INTEGER NOT NULL DEFAULT 0,
  mute_duration_secs INTEGER NOT NULL DEFAULT 0,
  photo_filter_enabled INTEGER NOT NULL DEFAULT 0,
  photo_filter_mute_minutes INTEGER NOT NULL DEFAULT 60,
  admins_bypass_photo_filter INTEGER NOT NULL DEFAULT 1,
  updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS group_admins (
  group_id INTEGER NOT NULL,
  user_id INTEGER NOT NULL,
  recorded_at INTEGER NOT NULL,
  PRIMARY KEY (group_id, user_id)
);

CREATE TABLE IF NOT EXISTS membership_requests (
  group_id INTEGER NOT NULL,
  user_id INTEGER NOT NULL,
  status TEXT NOT NULL,
  requested_at INTEGER NOT NULL,
  resolved_at INTEGER,
  challenge_chat_id INTEGER,
  challenge_message_id INTEGER,
  notice_chat_id INTEGER,
  notice_message_id INTEGER,
  PRIMARY KEY (group_id, user_id)
);

CREATE TABLE IF NOT EXISTS challenges (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  group_id INTEGER NOT NULL,
  user_id INTEGER NOT NULL,
  kind TEXT NOT NULL,
  answer TEXT NOT NULL,
  issued_at INTEGER NOT NULL,
  expires_at INTEGER NOT NULL,
  attempt INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS restrictions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  group_id INTEGER NOT NULL,
  user_id INTEGER NOT NULL,
  kind TEXT NOT NULL,
  reason TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  expires_at INTEGER
);
"#;

fn store_err(e: rusqlite::Error) -> WardenError {
    WardenError::Store(e.to_string())
}

fn conversion_err(detail: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, detail.into())
}

fn message_ref(chat_id: Option<i64>, message_id: Option<i64>) -> Option<MessageRef> {
    match (chat_id, message_id) {
        (Some(chat_id), Some(message_id)) => Some(MessageRef {
            chat_id,
            message_id,
        }),
        _ => None,
    }
}

fn policy_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupPolicy> {
    let kind: String = row.get("challenge_kind")?;
    Ok(GroupPolicy {
        challenge_enabled: row.get::<_, i64>("challenge_enabled")? == 1,
        challenge_kind: kind.parse::<ChallengeKind>().map_err(conversion_err)?,
        challenge_in_pm: row.get::<_, i64>("challenge_in_pm")? == 1,
        mute_new_members: row.get::<_, i64>("mute_new_members")? == 1,
        mute_duration_secs: row.get("mute_duration_secs")?,
        photo_filter_enabled: row.get::<_, i64>("photo_filter_enabled")? == 1,
        photo_filter_mute_minutes: row.get("photo_filter_mute_minutes")?,
        admins_bypass_photo_filter: row.get::<_, i64>("admins_bypass_photo_filter")? == 1,
    })
}

fn request_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MembershipRequest> {
    let status: String = row.get("status")?;
    Ok(MembershipRequest {
        group_id: GroupId(row.get("group_id")?),
        user_id: UserId(row.get("user_id")?),
        status: status.parse::<RequestStatus>().map_err(conversion_err)?,
        requested_at: row.get("requested_at")?,
        resolved_at: row.get("resolved_at")?,
        challenge_message: message_ref(
            row.get("challenge_chat_id")?,
            row.get("challenge_message_id")?,
        ),
        timeout_notice: message_ref(row.get("notice_chat_id")?, row.get("notice_message_id")?),
    })
}

fn write_policy(conn: &Connection, group: GroupId, policy: &GroupPolicy, now: i64) -> rusqlite::Result<()> {
    conn.execute(
        r#"
INSERT INTO group_policies (
  group_id, challenge_enabled, challenge_kind, challenge_in_pm,
  mute_new_members, mute_duration_secs,
  photo_filter_enabled, photo_filter_mute_minutes, admins_bypass_photo_filter,
  updated_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
ON CONFLICT(group_id) DO UPDATE SET
  challenge_enabled = excluded.challenge_enabled,
  challenge_kind = excluded.challenge_kind,
  challenge_in_pm = excluded.challenge_in_pm,
  mute_new_members = excluded.mute_new_members,
  mute_duration_secs = excluded.mute_duration_secs,
  photo_filter_enabled = excluded.photo_filter_enabled,
  photo_filter_mute_minutes = excluded.photo_filter_mute_minutes,
  admins_bypass_photo_filter = excluded.admins_bypass_photo_filter,
  updated_at = excluded.updated_at
"#,
        params![
            group.0,
            policy.challenge_enabled as i64,
            policy.challenge_kind.as_str(),
            policy.challenge_in_pm as i64,
            policy.mute_new_members as i64,
            policy.mute_duration_secs,
            policy.photo_filter_enabled as i64,
            policy.photo_filter_mute_minutes,
            policy.admins_bypass_photo_filter as i64,
            now
        ],
    )?;
    Ok(())
}

fn read_policy(conn: &Connection, group: GroupId) -> rusqlite::Result<Option<GroupPolicy>> {
    conn.query_row(
        "SELECT * FROM group_policies WHERE group_id = ?1",
        params![group.0],
        policy_from_row,
    )
    .optional()
}

/// Handle to the sqlite database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, WardenError> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        store
            .call(|conn| conn.execute_batch(SCHEMA))
            .await?;
        Ok(store)
    }

    /// Run `f` with a connection on the blocking pool.
    pub async fn call<T, F>(&self, f: F) -> Result<T, WardenError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let conn = Connection::open(path).map_err(store_err)?;
            f(&conn).map_err(store_err)
        })
        .await
        .map_err(|e| WardenError::Internal(format!("sqlite task join failed: {e}")))?
    }

    // === groups & admins ===

    /// Record a group (and optionally its creator) on first sight.
    pub async fn upsert_group(
        &self,
        group: GroupId,
        title: String,
        creator: Option<UserId>,
    ) -> Result<(), WardenError> {
        let now = chrono::Utc::now().timestamp();
        self.call(move |conn| {
            conn.execute(
                r#"
INSERT INTO groups (group_id, title, creator_user_id, created_at)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(group_id) DO UPDATE SET
  title = excluded.title,
  creator_user_id = COALESCE(groups.creator_user_id, excluded.creator_user_id)
"#,
                params![group.0, title, creator.map(|u| u.0), now],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn group_creator(&self, group: GroupId) -> Result<Option<UserId>, WardenError> {
        self.call(move |conn| {
            let creator: Option<Option<i64>> = conn
                .query_row(
                    "SELECT creator_user_id FROM groups WHERE group_id = ?1",
                    params![group.0],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(creator.flatten().map(UserId))
        })
        .await
    }

    pub async fn is_recorded_admin(
        &self,
        group: GroupId,
        user: UserId,
    ) -> Result<bool, WardenError> {
        self.call(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM group_admins WHERE group_id = ?1 AND user_id = ?2",
                    params![group.0, user.0],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    pub async fn record_admin(&self, group: GroupId, user: UserId) -> Result<(), WardenError> {
        let now = chrono::Utc::now().timestamp();
        self.call(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO group_admins (group_id, user_id, recorded_at) VALUES (?1, ?2, ?3)",
                params![group.0, user.0, now],
            )?;
            Ok(())
        })
        .await
    }

    // === policies ===

    pub async fn get_policy(&self, group: GroupId) -> Result<Option<GroupPolicy>, WardenError> {
        self.call(move |conn| read_policy(conn, group)).await
    }

    /// Read-modify-write a policy in one connection. Missing rows start from
    /// the all-disabled default.
    pub async fn upsert_policy(
        &self,
        group: GroupId,
        patch: PolicyPatch,
    ) -> Result<GroupPolicy, WardenError> {
        let now = chrono::Utc::now().timestamp();
        self.call(move |conn| {
            let mut policy = read_policy(conn, group)?.unwrap_or_default();
            patch.apply(&mut policy);
            write_policy(conn, group, &policy, now)?;
            Ok(policy)
        })
        .await
    }

    /// Persist the default policy for a group unless one already exists.
    pub async fn ensure_policy(&self, group: GroupId) -> Result<GroupPolicy, WardenError> {
        let now = chrono::Utc::now().timestamp();
        self.call(move |conn| {
            if let Some(existing) = read_policy(conn, group)? {
                return Ok(existing);
            }
            let policy = GroupPolicy::default();
            write_policy(conn, group, &policy, now)?;
            Ok(policy)
        })
        .await
    }

    // === membership requests ===

    /// Start (or restart) a request for the pair: any previous row is
    /// superseded and reset to `Pending`.
    pub async fn begin_request(&self, group: GroupId, user: UserId) -> Result<(), WardenError> {
        let now = chrono::Utc::now().timestamp();
        self.call(move |conn| {
            conn.execute(
                r#"
INSERT OR REPLACE INTO membership_requests
  (group_id, user_id, status, requested_at, resolved_at,
   challenge_chat_id, challenge_message_id, notice_chat_id, notice_message_id)
VALUES (?1, ?2, ?3, ?4, NULL, NULL, NULL, NULL, NULL)
"#,
                params![group.0, user.0, RequestStatus::Pending.as_str(), now],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_request(
        &self,
        group: GroupId,
        user: UserId,
    ) -> Result<Option<MembershipRequest>, WardenError> {
        self.call(move |conn| {
            conn.query_row(
                "SELECT * FROM membership_requests WHERE group_id = ?1 AND user_id = ?2",
                params![group.0, user.0],
                request_from_row,
            )
            .optional()
        })
        .await
    }

    /// Mark the challenge as issued and remember its on-screen message.
    pub async fn mark_challenge_issued(
        &self,
        group: GroupId,
        user: UserId,
        message: Option<MessageRef>,
    ) -> Result<(), WardenError> {
        self.call(move |conn| {
            conn.execute(
                r#"
UPDATE membership_requests
SET status = ?1, challenge_chat_id = ?2, challenge_message_id = ?3
WHERE group_id = ?4 AND user_id = ?5
"#,
                params![
                    RequestStatus::ChallengeIssued.as_str(),
                    message.map(|m| m.chat_id),
                    message.map(|m| m.message_id),
                    group.0,
                    user.0
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_timeout_notice(
        &self,
        group: GroupId,
        user: UserId,
        notice: Option<MessageRef>,
    ) -> Result<(), WardenError> {
        self.call(move |conn| {
            conn.execute(
                r#"
UPDATE membership_requests
SET notice_chat_id = ?1, notice_message_id = ?2
WHERE group_id = ?3 AND user_id = ?4
"#,
                params![
                    notice.map(|m| m.chat_id),
                    notice.map(|m| m.message_id),
                    group.0,
                    user.0
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Compare-and-set status transition. Returns `true` iff the row was in
    /// `from` and is now in `to`. The caller that gets `true` owns the
    /// transition's side effects; everyone else must treat the race as a
    /// no-op.
    pub async fn transition(
        &self,
        group: GroupId,
        user: UserId,
        from: RequestStatus,
        to: RequestStatus,
    ) -> Result<bool, WardenError> {
        let resolved_at = to.is_terminal().then(|| chrono::Utc::now().timestamp());
        let updated = self
            .call(move |conn| {
                conn.execute(
                    r#"
UPDATE membership_requests
SET status = ?1, resolved_at = COALESCE(?2, resolved_at)
WHERE group_id = ?3 AND user_id = ?4 AND status = ?5
"#,
                    params![to.as_str(), resolved_at, group.0, user.0, from.as_str()],
                )
            })
            .await?;
        Ok(updated == 1)
    }

    // === audit ===

    /// Append one issued challenge to the audit trail.
    pub async fn record_challenge(
        &self,
        group: GroupId,
        user: UserId,
        kind: ChallengeKind,
        answer: String,
        issued_at: i64,
        expires_at: i64,
        attempt: u32,
    ) -> Result<(), WardenError> {
        self.call(move |conn| {
            conn.execute(
                r#"
INSERT INTO challenges (group_id, user_id, kind, answer, issued_at, expires_at, attempt)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
"#,
                params![
                    group.0,
                    user.0,
                    kind.as_str(),
                    answer,
                    issued_at,
                    expires_at,
                    attempt
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn append_restriction(&self, record: RestrictionRecord) -> Result<(), WardenError> {
        self.call(move |conn| {
            conn.execute(
                r#"
INSERT INTO restrictions (group_id, user_id, kind, reason, created_at, expires_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
"#,
                params![
                    record.group_id.0,
                    record.user_id.0,
                    record.kind.as_str(),
                    record.reason,
                    record.created_at,
                    record.expires_at
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn restrictions_for(
        &self,
        group: GroupId,
    ) -> Result<Vec<RestrictionRecord>, WardenError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                r#"
SELECT group_id, user_id, kind, reason, created_at, expires_at
FROM restrictions WHERE group_id = ?1 ORDER BY id
"#,
            )?;
            let rows = stmt.query_map(params![group.0], |row| {
                let kind: String = row.get(2)?;
                Ok(RestrictionRecord {
                    group_id: GroupId(row.get(0)?),
                    user_id: UserId(row.get(1)?),
                    kind: match kind.as_str() {
                        "mute" => RestrictionType::Mute,
                        other => {
                            return Err(conversion_err(format!("unknown restriction: {other}")));
                        }
                    },
                    reason: row.get(3)?,
                    created_at: row.get(4)?,
                    expires_at: row.get(5)?,
                })
            })?;
            rows.collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.sqlite")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn policy_defaults_then_patch() {
        let (_dir, store) = temp_store().await;
        let group = GroupId(-100);

        assert!(store.get_policy(group).await.unwrap().is_none());

        let created = store.ensure_policy(group).await.unwrap();
        assert_eq!(created, GroupPolicy::default());

        let patched = store
            .upsert_policy(
                group,
                PolicyPatch {
                    challenge_enabled: Some(true),
                    challenge_kind: Some(ChallengeKind::Visual),
                    ..PolicyPatch::default()
                },
            )
            .await
            .unwrap();
        assert!(patched.challenge_enabled);
        assert_eq!(patched.challenge_kind, ChallengeKind::Visual);

        let read_back = store.get_policy(group).await.unwrap().unwrap();
        assert_eq!(read_back, patched);
    }

    #[tokio::test]
    async fn transition_is_a_compare_and_set() {
        let (_dir, store) = temp_store().await;
        let (group, user) = (GroupId(-1), UserId(7));

        store.begin_request(group, user).await.unwrap();
        store
            .mark_challenge_issued(group, user, None)
            .await
            .unwrap();

        // First transition wins.
        assert!(
            store
                .transition(
                    group,
                    user,
                    RequestStatus::ChallengeIssued,
                    RequestStatus::Approved
                )
                .await
                .unwrap()
        );
        // The loser of the race observes a no-op.
        assert!(
            !store
                .transition(
                    group,
                    user,
                    RequestStatus::ChallengeIssued,
                    RequestStatus::Expired
                )
                .await
                .unwrap()
        );

        let request = store.get_request(group, user).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Approved);
        assert!(request.resolved_at.is_some());
    }

    #[tokio::test]
    async fn rerequest_supersedes_terminal_row() {
        let (_dir, store) = temp_store().await;
        let (group, user) = (GroupId(-1), UserId(7));

        store.begin_request(group, user).await.unwrap();
        store
            .mark_challenge_issued(
                group,
                user,
                Some(MessageRef {
                    chat_id: 7,
                    message_id: 42,
                }),
            )
            .await
            .unwrap();
        store
            .transition(
                group,
                user,
                RequestStatus::ChallengeIssued,
                RequestStatus::Expired,
            )
            .await
            .unwrap();

        store.begin_request(group, user).await.unwrap();
        let request = store.get_request(group, user).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Pending);
        assert!(request.challenge_message.is_none());
        assert!(request.resolved_at.is_none());
    }

    #[tokio::test]
    async fn restrictions_are_append_only() {
        let (_dir, store) = temp_store().await;
        let group = GroupId(-5);

        for (user, reason) in [(UserId(1), "first"), (UserId(2), "second")] {
            store
                .append_restriction(RestrictionRecord {
                    group_id: group,
                    user_id: user,
                    kind: RestrictionType::Mute,
                    reason: reason.into(),
                    created_at: 1000,
                    expires_at: Some(4600),
                })
                .await
                .unwrap();
        }

        let records = store.restrictions_for(group).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].reason, "first");
        assert_eq!(records[1].user_id, UserId(2));
    }

    #[tokio::test]
    async fn creator_and_admins_are_memoized() {
        let (_dir, store) = temp_store().await;
        let group = GroupId(-9);

        store
            .upsert_group(group, "test group".into(), Some(UserId(11)))
            .await
            .unwrap();
        assert_eq!(store.group_creator(group).await.unwrap(), Some(UserId(11)));

        // A later upsert without a creator must not clobber the recorded one.
        store
            .upsert_group(group, "renamed".into(), None)
            .await
            .unwrap();
        assert_eq!(store.group_creator(group).await.unwrap(), Some(UserId(11)));

        assert!(!store.is_recorded_admin(group, UserId(3)).await.unwrap());
        store.record_admin(group, UserId(3)).await.unwrap();
        assert!(store.is_recorded_admin(group, UserId(3)).await.unwrap());
    }
}
