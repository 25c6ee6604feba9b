//! SQLite implementation of `MemberRepository`.
//!
//! Persistent storage that survives service restarts. The database has a
//! `schema_version` table; when the schema changes, increment
//! `CURRENT_SCHEMA_VERSION` and add a migration in `run_migrations()`.
//! Migrations run sequentially from the current version to the target.
//!
//! Synchronous rusqlite calls run inside `tokio::task::spawn_blocking` so
//! they never block the async runtime. The conditional status write is a
//! single `UPDATE ... WHERE status = ?` whose affected-row count decides
//! the race, so no explicit transaction is needed.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::state_machine::state::{
    AuditEntry, CommunityId, MemberRecord, OnboardingStatus, UserId,
};

use super::{MemberRepository, RepositoryError};

const CURRENT_SCHEMA_VERSION: i64 = 1;

pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open (or create) the database at `path` and bring the schema up to
    /// date.
    ///
    /// The database is configured with `journal_mode = WAL`,
    /// `synchronous = FULL` and a 5s busy timeout. WAL must actually take
    /// effect; SQLite can silently keep DELETE mode on filesystems without
    /// shared-memory support, so the returned mode is verified.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        RepositoryError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| RepositoryError::storage("open database", e))?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| RepositoryError::storage("set journal_mode", e))?;

        // In-memory databases report "memory", which is fine: they are
        // ephemeral and have no durability requirement.
        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(RepositoryError::storage(
                "configure journal_mode",
                format!(
                    "failed to enable WAL mode: SQLite returned '{}' instead of 'wal'",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .map_err(|e| RepositoryError::storage("configure pragmas", e))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| RepositoryError::storage("create schema_version table", e))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get schema version", e))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory repository for tests.
    pub fn new_in_memory() -> Result<Self, RepositoryError> {
        Self::new(":memory:")
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), RepositoryError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(RepositoryError::storage(
                "schema version",
                format!(
                    "database schema version {} is newer than supported version {}",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS members (
                    user_id INTEGER NOT NULL,
                    community_id INTEGER NOT NULL,
                    username TEXT NOT NULL,
                    nickname TEXT,
                    fields_json TEXT NOT NULL,
                    status INTEGER NOT NULL,
                    joined_at TEXT,
                    completed_at TEXT,
                    last_change_at TEXT,
                    PRIMARY KEY (user_id, community_id)
                );

                CREATE TABLE IF NOT EXISTS audit_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    community_id INTEGER NOT NULL,
                    user_id INTEGER,
                    actor_name TEXT,
                    action TEXT NOT NULL,
                    details_json TEXT NOT NULL,
                    at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_audit_lookup
                    ON audit_log(community_id, action, at);
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v1", e))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| RepositoryError::storage("update schema version", e))?;

        Ok(())
    }
}

/// Convert a platform id (u64) to i64 for SQLite storage.
fn id_to_i64(id: u64, operation: &'static str) -> Result<i64, RepositoryError> {
    i64::try_from(id).map_err(|_| {
        RepositoryError::storage(
            operation,
            format!("id {} exceeds maximum storable value", id),
        )
    })
}

fn i64_to_id(value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value)
        .map_err(|_| RepositoryError::Corrupt(format!("negative id {} in database", value)))
}

fn timestamp_to_text(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.to_rfc3339())
}

fn text_to_timestamp(text: Option<String>) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    match text {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| RepositoryError::Corrupt(format!("bad timestamp '{}': {}", raw, e))),
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<RawMemberRow> {
    Ok(RawMemberRow {
        user_id: row.get(0)?,
        community_id: row.get(1)?,
        username: row.get(2)?,
        nickname: row.get(3)?,
        fields_json: row.get(4)?,
        status: row.get(5)?,
        joined_at: row.get(6)?,
        completed_at: row.get(7)?,
        last_change_at: row.get(8)?,
    })
}

/// Column values straight out of SQLite, before decoding.
struct RawMemberRow {
    user_id: i64,
    community_id: i64,
    username: String,
    nickname: Option<String>,
    fields_json: String,
    status: i64,
    joined_at: Option<String>,
    completed_at: Option<String>,
    last_change_at: Option<String>,
}

impl RawMemberRow {
    fn decode(self) -> Result<MemberRecord, RepositoryError> {
        let status = OnboardingStatus::from_i64(self.status).ok_or_else(|| {
            RepositoryError::Corrupt(format!("unknown status encoding {}", self.status))
        })?;
        let fields = serde_json::from_str(&self.fields_json)
            .map_err(|e| RepositoryError::Corrupt(format!("bad fields JSON: {}", e)))?;

        Ok(MemberRecord {
            user_id: UserId(i64_to_id(self.user_id)?),
            community_id: CommunityId(i64_to_id(self.community_id)?),
            username: self.username,
            nickname: self.nickname,
            fields,
            status,
            joined_at: text_to_timestamp(self.joined_at)?,
            completed_at: text_to_timestamp(self.completed_at)?,
            last_change_at: text_to_timestamp(self.last_change_at)?,
        })
    }
}

const SELECT_MEMBER_COLUMNS: &str = "user_id, community_id, username, nickname, fields_json, \
     status, joined_at, completed_at, last_change_at";

#[async_trait]
impl MemberRepository for SqliteRepository {
    async fn get_member(
        &self,
        user_id: UserId,
        community_id: CommunityId,
    ) -> Result<Option<MemberRecord>, RepositoryError> {
        let conn = self.conn.clone();
        let user = id_to_i64(user_id.0, "get_member")?;
        let community = id_to_i64(community_id.0, "get_member")?;

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let raw = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM members WHERE user_id = ?1 AND community_id = ?2",
                        SELECT_MEMBER_COLUMNS
                    ),
                    params![user, community],
                    row_to_record,
                )
                .optional()
                .map_err(|e| RepositoryError::storage("get_member", e))?;

            raw.map(RawMemberRow::decode).transpose()
        })
        .await
        .map_err(|e| RepositoryError::storage("get_member", e))?
    }

    async fn upsert_member(&self, record: &MemberRecord) -> Result<(), RepositoryError> {
        let conn = self.conn.clone();
        let user = id_to_i64(record.user_id.0, "upsert_member")?;
        let community = id_to_i64(record.community_id.0, "upsert_member")?;
        let username = record.username.clone();
        let nickname = record.nickname.clone();
        let fields_json = serde_json::to_string(&record.fields)
            .map_err(|e| RepositoryError::storage("serialize fields", e))?;
        let status = record.status.as_i64();
        let joined_at = timestamp_to_text(record.joined_at);
        let completed_at = timestamp_to_text(record.completed_at);
        let last_change_at = timestamp_to_text(record.last_change_at);

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT INTO members (user_id, community_id, username, nickname, fields_json,
                                      status, joined_at, completed_at, last_change_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (user_id, community_id) DO UPDATE SET
                     username = excluded.username,
                     nickname = excluded.nickname,
                     fields_json = excluded.fields_json,
                     status = excluded.status,
                     joined_at = excluded.joined_at,
                     completed_at = excluded.completed_at,
                     last_change_at = excluded.last_change_at",
                params![
                    user,
                    community,
                    username,
                    nickname,
                    fields_json,
                    status,
                    joined_at,
                    completed_at,
                    last_change_at
                ],
            )
            .map_err(|e| RepositoryError::storage("upsert_member", e))?;
            Ok(())
        })
        .await
        .map_err(|e| RepositoryError::storage("upsert_member", e))?
    }

    async fn ensure_member(
        &self,
        user_id: UserId,
        community_id: CommunityId,
        username: &str,
        joined_at: Option<DateTime<Utc>>,
    ) -> Result<MemberRecord, RepositoryError> {
        let conn = self.conn.clone();
        let user = id_to_i64(user_id.0, "ensure_member")?;
        let community = id_to_i64(community_id.0, "ensure_member")?;
        let username = username.to_string();
        let joined_text = timestamp_to_text(joined_at);

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();

            // INSERT OR IGNORE keeps any existing record untouched.
            conn.execute(
                "INSERT OR IGNORE INTO members
                     (user_id, community_id, username, nickname, fields_json,
                      status, joined_at, completed_at, last_change_at)
                 VALUES (?1, ?2, ?3, NULL, '{}', 0, ?4, NULL, NULL)",
                params![user, community, username, joined_text],
            )
            .map_err(|e| RepositoryError::storage("ensure_member", e))?;

            let raw = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM members WHERE user_id = ?1 AND community_id = ?2",
                        SELECT_MEMBER_COLUMNS
                    ),
                    params![user, community],
                    row_to_record,
                )
                .map_err(|e| RepositoryError::storage("ensure_member", e))?;

            raw.decode()
        })
        .await
        .map_err(|e| RepositoryError::storage("ensure_member", e))?
    }

    async fn conditional_set_status(
        &self,
        user_id: UserId,
        community_id: CommunityId,
        expected: OnboardingStatus,
        new: OnboardingStatus,
    ) -> Result<bool, RepositoryError> {
        let conn = self.conn.clone();
        let user = id_to_i64(user_id.0, "conditional_set_status")?;
        let community = id_to_i64(community_id.0, "conditional_set_status")?;
        let expected = expected.as_i64();
        let new_status = new.as_i64();
        let now = Utc::now().to_rfc3339();
        let stamp_completed = new == OnboardingStatus::Approved;

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let sql = if stamp_completed {
                "UPDATE members SET status = ?1, last_change_at = ?2, completed_at = ?2
                 WHERE user_id = ?3 AND community_id = ?4 AND status = ?5"
            } else {
                "UPDATE members SET status = ?1, last_change_at = ?2
                 WHERE user_id = ?3 AND community_id = ?4 AND status = ?5"
            };
            let affected = conn
                .execute(sql, params![new_status, now, user, community, expected])
                .map_err(|e| RepositoryError::storage("conditional_set_status", e))?;
            Ok(affected == 1)
        })
        .await
        .map_err(|e| RepositoryError::storage("conditional_set_status", e))?
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), RepositoryError> {
        let conn = self.conn.clone();
        let community = id_to_i64(entry.community_id.0, "append_audit")?;
        let user = entry
            .user_id
            .map(|u| id_to_i64(u.0, "append_audit"))
            .transpose()?;
        let actor_name = entry.actor_name.clone();
        let action = entry.action.clone();
        let details_json = serde_json::to_string(&entry.details)
            .map_err(|e| RepositoryError::storage("serialize audit details", e))?;
        let at = entry.at.to_rfc3339();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT INTO audit_log (community_id, user_id, actor_name, action, details_json, at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![community, user, actor_name, action, details_json, at],
            )
            .map_err(|e| RepositoryError::storage("append_audit", e))?;
            Ok(())
        })
        .await
        .map_err(|e| RepositoryError::storage("append_audit", e))?
    }

    async fn list_audit(
        &self,
        community_id: CommunityId,
        action: &str,
    ) -> Result<Vec<AuditEntry>, RepositoryError> {
        let conn = self.conn.clone();
        let community = id_to_i64(community_id.0, "list_audit")?;
        let action = action.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn
                .prepare(
                    "SELECT community_id, user_id, actor_name, action, details_json, at
                     FROM audit_log
                     WHERE community_id = ?1 AND action = ?2
                     ORDER BY at ASC, id ASC",
                )
                .map_err(|e| RepositoryError::storage("list_audit", e))?;

            let rows = stmt
                .query_map(params![community, action], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })
                .map_err(|e| RepositoryError::storage("list_audit", e))?;

            let mut entries = Vec::new();
            for row in rows {
                let (community, user, actor_name, action, details_json, at) =
                    row.map_err(|e| RepositoryError::storage("list_audit", e))?;
                let details = serde_json::from_str(&details_json).map_err(|e| {
                    RepositoryError::Corrupt(format!("bad audit details JSON: {}", e))
                })?;
                let at = text_to_timestamp(Some(at))?.ok_or_else(|| {
                    RepositoryError::Corrupt("missing audit timestamp".to_string())
                })?;

                entries.push(AuditEntry {
                    community_id: CommunityId(i64_to_id(community)?),
                    user_id: user.map(i64_to_id).transpose()?.map(UserId),
                    actor_name,
                    action,
                    details,
                    at,
                });
            }
            Ok(entries)
        })
        .await
        .map_err(|e| RepositoryError::storage("list_audit", e))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn sample_record() -> MemberRecord {
        let mut fields = BTreeMap::new();
        fields.insert("first_name".to_string(), "Ada".to_string());
        fields.insert("last_name".to_string(), "Lovelace".to_string());
        MemberRecord {
            user_id: UserId(42),
            community_id: CommunityId(7),
            username: "ada".to_string(),
            nickname: Some("Ada Lovelace".to_string()),
            fields,
            status: OnboardingStatus::Pending,
            joined_at: Some(Utc::now()),
            completed_at: None,
            last_change_at: None,
        }
    }

    #[tokio::test]
    async fn member_round_trips_through_sqlite() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        let record = sample_record();
        repo.upsert_member(&record).await.unwrap();

        let loaded = repo
            .get_member(UserId(42), CommunityId(7))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.username, "ada");
        assert_eq!(loaded.nickname.as_deref(), Some("Ada Lovelace"));
        assert_eq!(loaded.fields.get("first_name").map(String::as_str), Some("Ada"));
        assert_eq!(loaded.status, OnboardingStatus::Pending);
        assert!(loaded.joined_at.is_some());
    }

    #[tokio::test]
    async fn missing_member_is_none() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        assert!(repo
            .get_member(UserId(1), CommunityId(7))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn ensure_member_creates_then_preserves() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        let created = repo
            .ensure_member(UserId(42), CommunityId(7), "ada", None)
            .await
            .unwrap();
        assert_eq!(created.status, OnboardingStatus::Pending);
        assert!(created.fields.is_empty());

        let mut updated = created.clone();
        updated.nickname = Some("Ada Lovelace".to_string());
        repo.upsert_member(&updated).await.unwrap();

        let again = repo
            .ensure_member(UserId(42), CommunityId(7), "renamed", None)
            .await
            .unwrap();
        assert_eq!(again.username, "ada");
        assert_eq!(again.nickname.as_deref(), Some("Ada Lovelace"));
    }

    #[tokio::test]
    async fn conditional_write_race_has_one_winner() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        repo.upsert_member(&sample_record()).await.unwrap();

        let won = repo
            .conditional_set_status(
                UserId(42),
                CommunityId(7),
                OnboardingStatus::Pending,
                OnboardingStatus::Approved,
            )
            .await
            .unwrap();
        let lost = repo
            .conditional_set_status(
                UserId(42),
                CommunityId(7),
                OnboardingStatus::Pending,
                OnboardingStatus::Denied,
            )
            .await
            .unwrap();

        assert!(won);
        assert!(!lost);

        let record = repo
            .get_member(UserId(42), CommunityId(7))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, OnboardingStatus::Approved);
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn denial_does_not_stamp_completed_at() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        repo.upsert_member(&sample_record()).await.unwrap();

        repo.conditional_set_status(
            UserId(42),
            CommunityId(7),
            OnboardingStatus::Pending,
            OnboardingStatus::Denied,
        )
        .await
        .unwrap();

        let record = repo
            .get_member(UserId(42), CommunityId(7))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, OnboardingStatus::Denied);
        assert!(record.completed_at.is_none());
        assert!(record.last_change_at.is_some());
    }

    #[tokio::test]
    async fn audit_entries_round_trip_in_order() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        for user in [1u64, 2] {
            repo.append_audit(&AuditEntry::new(
                CommunityId(7),
                Some(UserId(user)),
                Some("mod_abby".to_string()),
                "onboarding_approved",
                json!({"approved_user_id": user.to_string()}),
            ))
            .await
            .unwrap();
        }
        repo.append_audit(&AuditEntry::new(
            CommunityId(7),
            Some(UserId(3)),
            None,
            "onboarding_denied",
            json!({"denied_user_id": "3"}),
        ))
        .await
        .unwrap();

        let approved = repo
            .list_audit(CommunityId(7), "onboarding_approved")
            .await
            .unwrap();
        assert_eq!(approved.len(), 2);
        assert_eq!(approved[0].user_id, Some(UserId(1)));
        assert_eq!(
            approved[0].details.get("approved_user_id").and_then(|v| v.as_str()),
            Some("1")
        );
    }
}
