//! Application submission: validate, persist, and either auto-approve or
//! post an approval request for a human decision.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::chat::ChatGateway;
use crate::config::{ApprovalMode, CommunitySettings};
use crate::error::WardenError;
use crate::state_machine::decision::{decide, ActionKind, ApprovalAction};
use crate::state_machine::interpreter::apply_side_effects;
use crate::state_machine::render::{render, DecisionMeta};
use crate::state_machine::repository::MemberRepository;
use crate::state_machine::state::{Actor, AuditEntry, CommunityId, OnboardingStatus, UserId};

/// Display names are truncated to the platform limit, on a character
/// boundary.
pub const NICKNAME_MAX_LEN: usize = 32;

/// Record a member's arrival in a community. Creates a fresh pending
/// record if none exists; a returning member's existing record (and any
/// prior decision) is left untouched.
pub async fn bootstrap_member(
    repo: &dyn MemberRepository,
    community_id: CommunityId,
    user_id: UserId,
    username: &str,
) -> Result<OnboardingStatus, WardenError> {
    let record = repo
        .ensure_member(user_id, community_id, username, Some(Utc::now()))
        .await?;
    info!(
        user_id = %user_id,
        community_id = %community_id,
        status = %record.status,
        "member joined"
    );
    Ok(record.status)
}

/// Process a member's onboarding submission. Returns the status the
/// member ends up in.
pub async fn submit_application(
    repo: &dyn MemberRepository,
    gateway: &dyn ChatGateway,
    settings: &CommunitySettings,
    community_id: CommunityId,
    user_id: UserId,
    username: &str,
    submitted: BTreeMap<String, String>,
) -> Result<OnboardingStatus, WardenError> {
    let fields = validate_fields(settings, submitted)?;

    let existing = repo
        .ensure_member(user_id, community_id, username, Some(Utc::now()))
        .await?;

    if existing.status.is_terminal() && settings.prevent_resubmission {
        info!(
            user_id = %user_id,
            community_id = %community_id,
            status = %existing.status,
            "ignoring resubmission from decided member"
        );
        return Ok(existing.status);
    }

    let mut record = existing;
    record.username = username.to_string();
    record.nickname = compute_nickname(settings, &fields, username);
    record.fields = fields;
    repo.upsert_member(&record).await?;

    repo.append_audit(&AuditEntry::new(
        community_id,
        Some(user_id),
        None,
        "application_submitted",
        json!({ "user_id": user_id.to_string() }),
    ))
    .await?;

    match settings.approval_mode {
        ApprovalMode::Auto => {
            let won = repo
                .conditional_set_status(
                    user_id,
                    community_id,
                    OnboardingStatus::Pending,
                    OnboardingStatus::Approved,
                )
                .await?;
            if !won {
                let current = repo
                    .get_member(user_id, community_id)
                    .await?
                    .map(|r| r.status)
                    .unwrap_or(OnboardingStatus::Pending);
                return Ok(current);
            }

            let action = ApprovalAction {
                kind: ActionKind::Approve,
                actor: Actor::system(),
            };
            let decision = decide(OnboardingStatus::Pending, &action, &record.snapshot(), settings);
            let failures =
                apply_side_effects(gateway, community_id, &decision.side_effects).await;

            repo.append_audit(&AuditEntry::new(
                community_id,
                Some(user_id),
                Some(action.actor.name.clone()),
                "onboarding_approved",
                json!({
                    "approved_user_id": user_id.to_string(),
                    "nickname": record.nickname,
                    "side_effect_failures": failures,
                }),
            ))
            .await?;

            Ok(OnboardingStatus::Approved)
        }
        ApprovalMode::Manual => {
            let Some(channel_id) = settings.approval_channel_id else {
                warn!(
                    community_id = %community_id,
                    "manual approval configured without an approval channel; \
                     application stays pending"
                );
                return Ok(OnboardingStatus::Pending);
            };

            let visual = render(
                OnboardingStatus::Pending,
                &record.snapshot(),
                &DecisionMeta::default(),
            );
            let message_id = gateway.post_message(channel_id, &visual).await?;
            info!(
                user_id = %user_id,
                community_id = %community_id,
                message_id = %message_id,
                "posted approval request"
            );

            Ok(OnboardingStatus::Pending)
        }
    }
}

/// Check submitted values against the community's field descriptors.
/// Unconfigured keys are dropped rather than stored.
fn validate_fields(
    settings: &CommunitySettings,
    submitted: BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, WardenError> {
    let mut accepted = BTreeMap::new();

    for descriptor in settings.effective_fields() {
        let value = submitted
            .get(&descriptor.name)
            .map(|v| v.trim().to_string())
            .unwrap_or_default();

        if value.is_empty() {
            if descriptor.required {
                return Err(WardenError::Validation(format!(
                    "field '{}' is required",
                    descriptor.label
                )));
            }
            continue;
        }

        if value.chars().count() > descriptor.max_length {
            return Err(WardenError::Validation(format!(
                "field '{}' exceeds {} characters",
                descriptor.label, descriptor.max_length
            )));
        }

        accepted.insert(descriptor.name, value);
    }

    Ok(accepted)
}

/// Compute the display name to set on approval.
///
/// Preference order: the community's template with `{field}` placeholders
/// substituted, then "first_name last_name", then the first submitted
/// field value, then the platform username. The result is truncated to
/// `NICKNAME_MAX_LEN` characters.
fn compute_nickname(
    settings: &CommunitySettings,
    fields: &BTreeMap<String, String>,
    username: &str,
) -> Option<String> {
    let from_template = settings
        .nickname_template
        .as_deref()
        .and_then(|template| apply_template(template, fields));

    let from_names = match (fields.get("first_name"), fields.get("last_name")) {
        (Some(first), Some(last)) => Some(format!("{} {}", first, last)),
        _ => None,
    };

    let candidate = from_template
        .or(from_names)
        .or_else(|| fields.values().next().cloned())
        .unwrap_or_else(|| username.to_string());

    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(NICKNAME_MAX_LEN).collect())
}

/// Substitute `{name}` placeholders. Returns `None` when a placeholder
/// has no matching field, so the caller can fall through.
fn apply_template(template: &str, fields: &BTreeMap<String, String>) -> Option<String> {
    let mut result = template.to_string();
    for (name, value) in fields {
        result = result.replace(&format!("{{{}}}", name), value);
    }
    if result.contains('{') {
        return None;
    }
    let result = result.trim().to_string();
    if result.is_empty() {
        None
    } else {
        Some(result)
    }
}
