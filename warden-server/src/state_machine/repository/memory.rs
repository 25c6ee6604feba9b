//! In-memory repository for tests and local development.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::state_machine::state::{
    AuditEntry, CommunityId, MemberRecord, OnboardingStatus, UserId,
};

use super::{MemberRepository, RepositoryError};

#[derive(Default)]
pub struct InMemoryRepository {
    members: RwLock<HashMap<(UserId, CommunityId), MemberRecord>>,
    audit: RwLock<Vec<AuditEntry>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemberRepository for InMemoryRepository {
    async fn get_member(
        &self,
        user_id: UserId,
        community_id: CommunityId,
    ) -> Result<Option<MemberRecord>, RepositoryError> {
        let members = self.members.read().await;
        Ok(members.get(&(user_id, community_id)).cloned())
    }

    async fn upsert_member(&self, record: &MemberRecord) -> Result<(), RepositoryError> {
        let mut members = self.members.write().await;
        members.insert((record.user_id, record.community_id), record.clone());
        Ok(())
    }

    async fn ensure_member(
        &self,
        user_id: UserId,
        community_id: CommunityId,
        username: &str,
        joined_at: Option<DateTime<Utc>>,
    ) -> Result<MemberRecord, RepositoryError> {
        let mut members = self.members.write().await;
        let record = members
            .entry((user_id, community_id))
            .or_insert_with(|| MemberRecord::new_pending(user_id, community_id, username, joined_at));
        Ok(record.clone())
    }

    async fn conditional_set_status(
        &self,
        user_id: UserId,
        community_id: CommunityId,
        expected: OnboardingStatus,
        new: OnboardingStatus,
    ) -> Result<bool, RepositoryError> {
        let mut members = self.members.write().await;
        let Some(record) = members.get_mut(&(user_id, community_id)) else {
            return Ok(false);
        };
        if record.status != expected {
            return Ok(false);
        }

        let now = Utc::now();
        record.status = new;
        record.last_change_at = Some(now);
        if new == OnboardingStatus::Approved {
            record.completed_at = Some(now);
        }
        Ok(true)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), RepositoryError> {
        let mut audit = self.audit.write().await;
        audit.push(entry.clone());
        Ok(())
    }

    async fn list_audit(
        &self,
        community_id: CommunityId,
        action: &str,
    ) -> Result<Vec<AuditEntry>, RepositoryError> {
        let audit = self.audit.read().await;
        let mut entries: Vec<AuditEntry> = audit
            .iter()
            .filter(|e| e.community_id == community_id && e.action == action)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.at);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn ensure_member_is_idempotent() {
        let repo = InMemoryRepository::new();
        let first = repo
            .ensure_member(UserId(42), CommunityId(7), "ada", None)
            .await
            .unwrap();
        assert_eq!(first.status, OnboardingStatus::Pending);

        // A second call must not reset an existing record.
        repo.conditional_set_status(
            UserId(42),
            CommunityId(7),
            OnboardingStatus::Pending,
            OnboardingStatus::Approved,
        )
        .await
        .unwrap();
        let again = repo
            .ensure_member(UserId(42), CommunityId(7), "ada", None)
            .await
            .unwrap();
        assert_eq!(again.status, OnboardingStatus::Approved);
    }

    #[tokio::test]
    async fn conditional_write_succeeds_exactly_once() {
        let repo = InMemoryRepository::new();
        repo.ensure_member(UserId(42), CommunityId(7), "ada", None)
            .await
            .unwrap();

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
        assert!(record.last_change_at.is_some());
    }

    #[tokio::test]
    async fn conditional_write_on_missing_member_is_false() {
        let repo = InMemoryRepository::new();
        let won = repo
            .conditional_set_status(
                UserId(1),
                CommunityId(7),
                OnboardingStatus::Pending,
                OnboardingStatus::Approved,
            )
            .await
            .unwrap();
        assert!(!won);
    }

    #[tokio::test]
    async fn audit_listing_filters_by_action_and_orders_by_time() {
        let repo = InMemoryRepository::new();
        for (action, user) in [
            ("onboarding_approved", 1u64),
            ("onboarding_denied", 2),
            ("onboarding_approved", 3),
        ] {
            repo.append_audit(&AuditEntry::new(
                CommunityId(7),
                Some(UserId(user)),
                Some("mod_abby".to_string()),
                action,
                json!({"approved_user_id": user.to_string()}),
            ))
            .await
            .unwrap();
        }

        let approved = repo
            .list_audit(CommunityId(7), "onboarding_approved")
            .await
            .unwrap();
        assert_eq!(approved.len(), 2);
        assert_eq!(approved[0].user_id, Some(UserId(1)));
        assert_eq!(approved[1].user_id, Some(UserId(3)));
    }
}
