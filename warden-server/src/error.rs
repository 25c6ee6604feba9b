//! Error taxonomy for the onboarding core.
//!
//! The split matters for propagation: anything that fails before the
//! conditional status write is fully recoverable (no partial state), while
//! failures after the write are best-effort, logged and counted rather
//! than surfaced as errors.

use crate::chat::GatewayError;
use crate::state_machine::repository::RepositoryError;
use crate::state_machine::state::{CommunityId, UserId};

#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    /// Malformed submission fields. User-correctable, surfaced to the submitter.
    #[error("invalid submission: {0}")]
    Validation(String),

    /// The acting user is not in the configured approver role set.
    /// No state change has occurred.
    #[error("user {actor} is not an approver in community {community}")]
    Permission {
        actor: UserId,
        community: CommunityId,
    },

    /// Target member id could not be resolved, or no member record exists.
    #[error("{0}")]
    NotFound(String),

    /// A store or chat-platform call failed. Recoverable by retrying;
    /// the sweep counts these per item instead of aborting.
    #[error("transient failure: {0}")]
    Transient(String),
}

impl From<RepositoryError> for WardenError {
    fn from(err: RepositoryError) -> Self {
        WardenError::Transient(err.to_string())
    }
}

impl From<GatewayError> for WardenError {
    fn from(err: GatewayError) -> Self {
        WardenError::Transient(err.to_string())
    }
}
