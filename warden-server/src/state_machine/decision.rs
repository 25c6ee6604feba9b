//! The pure transition function for approval actions.
//!
//! `decide` never performs I/O. It maps the current status plus an
//! approve/deny action to the next status, the side effects to run, and
//! the message render to display. Callers are responsible for committing
//! the transition atomically before executing the effects.

use crate::config::CommunitySettings;

use super::effect::SideEffect;
use super::render::{render, DecisionMeta, VisualSpec};
use super::state::{Actor, MemberSnapshot, OnboardingStatus};

pub const APPROVED_NOTIFICATION: &str =
    "Your onboarding application has been approved. Welcome aboard!";
pub const DENIED_NOTIFICATION: &str =
    "Your onboarding application has been denied. Please contact a moderator if you have questions.";

/// Which control was clicked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Approve,
    Deny,
}

impl ActionKind {
    /// The terminal status this action drives toward.
    pub fn target_status(self) -> OnboardingStatus {
        match self {
            Self::Approve => OnboardingStatus::Approved,
            Self::Deny => OnboardingStatus::Denied,
        }
    }
}

/// An approve/deny action attributed to whoever performed it.
#[derive(Debug, Clone)]
pub struct ApprovalAction {
    pub kind: ActionKind,
    pub actor: Actor,
}

/// Outcome of `decide`: the state to commit, the effects to run, and the
/// render to display.
#[derive(Debug, Clone)]
pub struct Decision {
    pub next_status: OnboardingStatus,
    /// True when the member was already in a terminal state. No effects
    /// are produced and nothing should be committed; the caller only
    /// refreshes the displayed message.
    pub already_decided: bool,
    pub side_effects: Vec<SideEffect>,
    pub render: VisualSpec,
}

/// Decide what an approval action does given the current status.
///
/// From `Pending` the action wins: the target status is returned with the
/// effects the community's settings call for. From a terminal status the
/// action is a no-op (`already_decided`), which is how the loser of a
/// concurrent double-click converges on the winner's outcome.
pub fn decide(
    current: OnboardingStatus,
    action: &ApprovalAction,
    snapshot: &MemberSnapshot,
    settings: &CommunitySettings,
) -> Decision {
    if current.is_terminal() {
        // Attribute the render to this actor only when their action
        // matches the status already in force; otherwise leave the
        // attribution blank and let the caller recover the original
        // decider from the audit log.
        let meta = if action.kind.target_status() == current {
            DecisionMeta::by(action.actor.name.clone())
        } else {
            DecisionMeta::default()
        };
        return Decision {
            next_status: current,
            already_decided: true,
            side_effects: Vec::new(),
            render: render(current, snapshot, &meta),
        };
    }

    let next_status = action.kind.target_status();
    let side_effects = match action.kind {
        ActionKind::Approve => approval_effects(snapshot, settings),
        ActionKind::Deny => vec![SideEffect::Notify {
            user_id: snapshot.user_id,
            message: DENIED_NOTIFICATION.to_string(),
        }],
    };

    Decision {
        next_status,
        already_decided: false,
        side_effects,
        render: render(
            next_status,
            snapshot,
            &DecisionMeta::by(action.actor.name.clone()),
        ),
    }
}

fn approval_effects(snapshot: &MemberSnapshot, settings: &CommunitySettings) -> Vec<SideEffect> {
    let mut effects = Vec::new();

    if settings.set_nickname {
        if let Some(nickname) = &snapshot.nickname {
            effects.push(SideEffect::SetNickname {
                user_id: snapshot.user_id,
                nickname: nickname.clone(),
            });
        }
    }

    if settings.grant_role {
        if let Some(role_id) = settings.onboarded_role_id {
            effects.push(SideEffect::GrantRole {
                user_id: snapshot.user_id,
                role_id,
            });
        }
    }

    effects.push(SideEffect::Notify {
        user_id: snapshot.user_id,
        message: APPROVED_NOTIFICATION.to_string(),
    });

    effects
}
