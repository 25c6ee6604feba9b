//! Side effects as data.
//!
//! A `SideEffect` describes an external identity operation produced by a
//! decision. The interpreter executes them against the chat gateway; the
//! decision function itself does no I/O. All of these are best-effort:
//! the status transition commits first, and a failed effect is logged and
//! counted, never rolled back into the store.

use serde::{Deserialize, Serialize};

use super::state::{RoleId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SideEffect {
    /// Set the member's display name in the community.
    SetNickname { user_id: UserId, nickname: String },

    /// Grant the configured onboarded role.
    GrantRole { user_id: UserId, role_id: RoleId },

    /// Send a direct notification to the member.
    Notify { user_id: UserId, message: String },
}
