//! Status store: authoritative onboarding state and the audit log.
//!
//! `conditional_set_status` is the single mutual-exclusion primitive in
//! the system. Two concurrent approvals race on it; exactly one observes
//! `true` and goes on to apply side effects, the other converges on the
//! winner's outcome.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::state_machine::state::{
    AuditEntry, CommunityId, MemberRecord, OnboardingStatus, UserId,
};

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage error during {op}: {message}")]
    Storage { op: &'static str, message: String },

    #[error("corrupt stored data: {0}")]
    Corrupt(String),
}

impl RepositoryError {
    pub fn storage(op: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Storage {
            op,
            message: err.to_string(),
        }
    }
}

#[async_trait]
pub trait MemberRepository: Send + Sync {
    async fn get_member(
        &self,
        user_id: UserId,
        community_id: CommunityId,
    ) -> Result<Option<MemberRecord>, RepositoryError>;

    /// Insert or fully replace a member record.
    async fn upsert_member(&self, record: &MemberRecord) -> Result<(), RepositoryError>;

    /// Fetch the member, creating a fresh pending record if none exists.
    async fn ensure_member(
        &self,
        user_id: UserId,
        community_id: CommunityId,
        username: &str,
        joined_at: Option<DateTime<Utc>>,
    ) -> Result<MemberRecord, RepositoryError>;

    /// Atomically set the status to `new` if it is currently `expected`.
    ///
    /// Returns `true` when this call performed the transition. On success
    /// the store also stamps `last_change_at`, and `completed_at` when the
    /// new status is `Approved`.
    async fn conditional_set_status(
        &self,
        user_id: UserId,
        community_id: CommunityId,
        expected: OnboardingStatus,
        new: OnboardingStatus,
    ) -> Result<bool, RepositoryError>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), RepositoryError>;

    /// Audit entries for a community and action, oldest first.
    async fn list_audit(
        &self,
        community_id: CommunityId,
        action: &str,
    ) -> Result<Vec<AuditEntry>, RepositoryError>;
}
