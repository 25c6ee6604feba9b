//! Core types for the onboarding state machine.
//!
//! Ids are newtypes to prevent mixing: a `UserId` is never a `ChannelId`.
//! `OnboardingStatus` keeps the integer encoding the store has always used
//! (pending 0, approved 1, denied -1), so existing rows stay readable.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Newtype for a platform user id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

/// Newtype for a community (tenant/guild) id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommunityId(pub u64);

/// Newtype for a chat channel id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

/// Newtype for a chat message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

/// Newtype for a platform role id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleId(pub u64);

macro_rules! impl_id_display {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl From<u64> for $ty {
                fn from(id: u64) -> Self {
                    Self(id)
                }
            }
        )*
    };
}

impl_id_display!(UserId, CommunityId, ChannelId, MessageId, RoleId);

/// Authoritative onboarding status for a (member, community) pair.
///
/// The only transitions this core performs are `Pending -> Approved` and
/// `Pending -> Denied`. A reset back to `Pending` is an external
/// administrative action that starts a fresh submission cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnboardingStatus {
    Pending,
    Approved,
    Denied,
}

impl OnboardingStatus {
    /// Integer encoding used by the status store.
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Pending => 0,
            Self::Approved => 1,
            Self::Denied => -1,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Pending),
            1 => Some(Self::Approved),
            -1 => Some(Self::Denied),
            _ => None,
        }
    }

    /// Machine-readable key embedded in the rendered message's `Status`
    /// field. The sweep compares this key, never the display title.
    pub fn status_key(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for OnboardingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status_key())
    }
}

/// One row of the status store: a member's onboarding state in one community.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub user_id: UserId,
    pub community_id: CommunityId,
    /// Platform handle at the time we first saw the member.
    pub username: String,
    /// Computed display name, set on submission.
    pub nickname: Option<String>,
    /// Submitted onboarding fields, open key -> value.
    pub fields: BTreeMap<String, String>,
    pub status: OnboardingStatus,
    pub joined_at: Option<DateTime<Utc>>,
    /// Set only on the transition into `Approved`.
    pub completed_at: Option<DateTime<Utc>>,
    pub last_change_at: Option<DateTime<Utc>>,
}

impl MemberRecord {
    /// A fresh pending record for a member we haven't seen before.
    pub fn new_pending(
        user_id: UserId,
        community_id: CommunityId,
        username: impl Into<String>,
        joined_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            user_id,
            community_id,
            username: username.into(),
            nickname: None,
            fields: BTreeMap::new(),
            status: OnboardingStatus::Pending,
            joined_at,
            completed_at: None,
            last_change_at: None,
        }
    }

    /// The read-only view the renderer and decision function work from.
    pub fn snapshot(&self) -> MemberSnapshot {
        MemberSnapshot {
            user_id: self.user_id,
            username: self.username.clone(),
            nickname: self.nickname.clone(),
            fields: self.fields.clone(),
        }
    }
}

/// Member view used for rendering and deciding. No status in here: the
/// decision function receives the status separately so the two can never
/// disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberSnapshot {
    pub user_id: UserId,
    pub username: String,
    pub nickname: Option<String>,
    pub fields: BTreeMap<String, String>,
}

/// Who performed an action. Sweep-driven corrections and auto-approvals
/// carry no user id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: Option<UserId>,
    pub name: String,
}

impl Actor {
    pub fn user(id: UserId, name: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            name: name.into(),
        }
    }

    /// The automatic approver used in auto-approval mode.
    pub fn system() -> Self {
        Self {
            id: None,
            name: "system".to_string(),
        }
    }

    /// Attribution used by the sweep when the original decider is not
    /// recoverable from the audit log.
    pub fn sync_fallback() -> Self {
        Self {
            id: None,
            name: "System (sync)".to_string(),
        }
    }
}

/// Append-only audit record. `sync_*` actions mark sweep-driven corrections
/// so duplicate application can be diagnosed against actor-driven entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub community_id: CommunityId,
    pub user_id: Option<UserId>,
    pub actor_name: Option<String>,
    pub action: String,
    pub details: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        community_id: CommunityId,
        user_id: Option<UserId>,
        actor_name: Option<String>,
        action: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            community_id,
            user_id,
            actor_name,
            action: action.into(),
            details,
            at: Utc::now(),
        }
    }
}
