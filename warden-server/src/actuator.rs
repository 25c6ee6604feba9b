//! Interactive-control actuator: what happens when an approver clicks
//! approve or deny on a posted request.
//!
//! The click handler commits the status transition with the repository's
//! conditional write before touching the platform. When two approvers race,
//! exactly one wins the write and applies side effects; the loser reloads
//! the record, observes the decided status and only refreshes the message.

use serde_json::json;
use tracing::{info, warn};

use crate::chat::{ChatGateway, ChatMessage, PermissionOracle};
use crate::config::CommunitySettings;
use crate::error::WardenError;
use crate::state_machine::decision::{decide, ActionKind, ApprovalAction};
use crate::state_machine::interpreter::apply_side_effects;
use crate::state_machine::render::{extract_user_id, render, DecisionMeta, VisualSpec};
use crate::state_machine::repository::MemberRepository;
use crate::state_machine::state::{
    Actor, AuditEntry, CommunityId, OnboardingStatus, UserId,
};

/// Audit action name and details key for a terminal status.
pub(crate) fn decision_audit_keys(status: OnboardingStatus) -> Option<(&'static str, &'static str)> {
    match status {
        OnboardingStatus::Approved => Some(("onboarding_approved", "approved_user_id")),
        OnboardingStatus::Denied => Some(("onboarding_denied", "denied_user_id")),
        OnboardingStatus::Pending => None,
    }
}

/// Recover the name of whoever originally decided this member, from the
/// earliest matching decision audit entry.
pub(crate) async fn recover_decider(
    repo: &dyn MemberRepository,
    community_id: CommunityId,
    user_id: UserId,
    status: OnboardingStatus,
) -> Result<Option<String>, WardenError> {
    let Some((action, key)) = decision_audit_keys(status) else {
        return Ok(None);
    };

    let entries = repo.list_audit(community_id, action).await?;
    let wanted = user_id.to_string();
    Ok(entries
        .into_iter()
        .find(|entry| {
            entry
                .details
                .get(key)
                .and_then(|v| v.as_str())
                .map(|v| v == wanted)
                .unwrap_or(false)
        })
        .and_then(|entry| entry.actor_name))
}

/// Handle an approve/deny click on an approval request message.
///
/// Returns the visual the message was updated to show. Permission failures
/// change nothing, including the message.
pub async fn handle_click(
    repo: &dyn MemberRepository,
    gateway: &dyn ChatGateway,
    oracle: &dyn PermissionOracle,
    settings: &CommunitySettings,
    community_id: CommunityId,
    message: &ChatMessage,
    actor: Actor,
    kind: ActionKind,
) -> Result<VisualSpec, WardenError> {
    let visual = message
        .visual
        .as_ref()
        .ok_or_else(|| WardenError::NotFound("message has no structured content".to_string()))?;

    let user_id = extract_user_id(visual).ok_or_else(|| {
        WardenError::NotFound("could not identify the member this request is for".to_string())
    })?;

    let actor_id = actor.id.ok_or_else(|| {
        WardenError::Validation("approval actions require an acting user".to_string())
    })?;
    if !oracle.is_approver(actor_id, community_id).await? {
        return Err(WardenError::Permission {
            actor: actor_id,
            community: community_id,
        });
    }

    let record = repo.get_member(user_id, community_id).await?.ok_or_else(|| {
        WardenError::NotFound(format!(
            "no onboarding record for member {} in community {}",
            user_id, community_id
        ))
    })?;

    let action = ApprovalAction { kind, actor };
    let decision = decide(record.status, &action, &record.snapshot(), settings);

    if decision.already_decided {
        return refresh_decided_message(repo, gateway, community_id, message, &record.snapshot(), record.status)
            .await;
    }

    let won = repo
        .conditional_set_status(
            user_id,
            community_id,
            OnboardingStatus::Pending,
            decision.next_status,
        )
        .await?;

    if !won {
        // Lost the race: somebody else decided between our read and write.
        let current = repo
            .get_member(user_id, community_id)
            .await?
            .map(|r| r.status)
            .unwrap_or(record.status);
        info!(
            user_id = %user_id,
            community_id = %community_id,
            status = %current,
            "approval action lost the race, refreshing message"
        );
        return refresh_decided_message(repo, gateway, community_id, message, &record.snapshot(), current)
            .await;
    }

    let failures = apply_side_effects(gateway, community_id, &decision.side_effects).await;
    if failures > 0 {
        warn!(
            user_id = %user_id,
            community_id = %community_id,
            failures,
            "some side effects failed after approval decision"
        );
    }

    if let Some((audit_action, key)) = decision_audit_keys(decision.next_status) {
        repo.append_audit(&AuditEntry::new(
            community_id,
            Some(user_id),
            Some(action.actor.name.clone()),
            audit_action,
            json!({
                key: user_id.to_string(),
                "nickname": record.nickname,
                "side_effect_failures": failures,
            }),
        ))
        .await?;
    }

    gateway
        .edit_message(message.channel_id, message.message_id, &decision.render)
        .await?;

    info!(
        user_id = %user_id,
        community_id = %community_id,
        actor = %action.actor.name,
        status = %decision.next_status,
        "approval decision committed"
    );

    Ok(decision.render)
}

/// Re-render a message for a member whose status is already terminal,
/// attributing the original decider when the audit log knows them.
async fn refresh_decided_message(
    repo: &dyn MemberRepository,
    gateway: &dyn ChatGateway,
    community_id: CommunityId,
    message: &ChatMessage,
    snapshot: &crate::state_machine::state::MemberSnapshot,
    status: OnboardingStatus,
) -> Result<VisualSpec, WardenError> {
    let meta = recover_decider(repo, community_id, snapshot.user_id, status)
        .await?
        .map(DecisionMeta::by)
        .unwrap_or_default();

    let visual = render(status, snapshot, &meta);
    gateway
        .edit_message(message.channel_id, message.message_id, &visual)
        .await?;
    Ok(visual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::fake::FakeGateway;
    use crate::chat::RoleSetOracle;
    use crate::config::SettingsMap;
    use crate::state_machine::render::{APPROVED_BY_FIELD, STATUS_FIELD};
    use crate::state_machine::repository::InMemoryRepository;
    use crate::state_machine::state::{ChannelId, MemberRecord, RoleId};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    const COMMUNITY: CommunityId = CommunityId(7);
    const MEMBER: UserId = UserId(42);
    const APPROVER: UserId = UserId(1);
    const CHANNEL: ChannelId = ChannelId(500);

    fn settings() -> CommunitySettings {
        CommunitySettings {
            approver_role_ids: vec![RoleId(11)],
            onboarded_role_id: Some(RoleId(900)),
            approval_channel_id: Some(CHANNEL),
            ..CommunitySettings::default()
        }
    }

    fn pending_record() -> MemberRecord {
        let mut fields = BTreeMap::new();
        fields.insert("first_name".to_string(), "Ada".to_string());
        let mut record = MemberRecord::new_pending(MEMBER, COMMUNITY, "ada", None);
        record.nickname = Some("Ada Lovelace".to_string());
        record.fields = fields;
        record
    }

    struct Fixture {
        repo: Arc<InMemoryRepository>,
        gateway: Arc<FakeGateway>,
        oracle: RoleSetOracle,
        message: ChatMessage,
    }

    async fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryRepository::new());
        let gateway = Arc::new(FakeGateway::new());
        gateway.give_roles(COMMUNITY, APPROVER, vec![RoleId(11)]);

        repo.upsert_member(&pending_record()).await.unwrap();
        let visual = render(
            OnboardingStatus::Pending,
            &pending_record().snapshot(),
            &DecisionMeta::default(),
        );
        let message_id = gateway.seed_message(CHANNEL, true, Some(visual.clone()));
        let message = ChatMessage {
            message_id,
            channel_id: CHANNEL,
            author_is_self: true,
            visual: Some(visual),
        };

        let map = SettingsMap::from_entries([(COMMUNITY, settings())]);
        let oracle = RoleSetOracle::new(gateway.clone(), Arc::new(map));

        Fixture {
            repo,
            gateway,
            oracle,
            message,
        }
    }

    #[tokio::test]
    async fn approve_click_commits_and_applies_effects() {
        let fx = fixture().await;

        let visual = handle_click(
            fx.repo.as_ref(),
            fx.gateway.as_ref(),
            &fx.oracle,
            &settings(),
            COMMUNITY,
            &fx.message,
            Actor::user(APPROVER, "mod_abby"),
            ActionKind::Approve,
        )
        .await
        .unwrap();

        assert_eq!(visual.field(STATUS_FIELD), Some("approved"));
        assert_eq!(visual.field(APPROVED_BY_FIELD), Some("mod_abby"));
        assert!(!visual.controls_enabled);

        let record = fx.repo.get_member(MEMBER, COMMUNITY).await.unwrap().unwrap();
        assert_eq!(record.status, OnboardingStatus::Approved);

        assert_eq!(fx.gateway.nicknames().len(), 1);
        assert_eq!(fx.gateway.role_grants().len(), 1);
        assert_eq!(fx.gateway.direct_messages().len(), 1);
        assert_eq!(fx.gateway.edits().len(), 1);

        let audits = fx
            .repo
            .list_audit(COMMUNITY, "onboarding_approved")
            .await
            .unwrap();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].actor_name.as_deref(), Some("mod_abby"));
    }

    #[tokio::test]
    async fn non_approver_is_rejected_without_state_change() {
        let fx = fixture().await;

        let err = handle_click(
            fx.repo.as_ref(),
            fx.gateway.as_ref(),
            &fx.oracle,
            &settings(),
            COMMUNITY,
            &fx.message,
            Actor::user(UserId(99), "rando"),
            ActionKind::Approve,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, WardenError::Permission { .. }));
        let record = fx.repo.get_member(MEMBER, COMMUNITY).await.unwrap().unwrap();
        assert_eq!(record.status, OnboardingStatus::Pending);
        assert!(fx.gateway.edits().is_empty());
        assert!(fx.gateway.direct_messages().is_empty());
    }

    #[tokio::test]
    async fn concurrent_clicks_converge_with_one_effect_application() {
        let fx = fixture().await;
        fx.gateway.give_roles(COMMUNITY, UserId(2), vec![RoleId(11)]);
        let settings = settings();

        let approve = handle_click(
            fx.repo.as_ref(),
            fx.gateway.as_ref(),
            &fx.oracle,
            &settings,
            COMMUNITY,
            &fx.message,
            Actor::user(APPROVER, "mod_abby"),
            ActionKind::Approve,
        );
        let deny = handle_click(
            fx.repo.as_ref(),
            fx.gateway.as_ref(),
            &fx.oracle,
            &settings,
            COMMUNITY,
            &fx.message,
            Actor::user(UserId(2), "mod_carol"),
            ActionKind::Deny,
        );

        let (a, b) = tokio::join!(approve, deny);
        let (a, b) = (a.unwrap(), b.unwrap());

        // Both callers see the same terminal status.
        assert_eq!(a.field(STATUS_FIELD), b.field(STATUS_FIELD));

        let record = fx.repo.get_member(MEMBER, COMMUNITY).await.unwrap().unwrap();
        assert!(record.status.is_terminal());

        // Exactly one decision was audited and one set of effects applied.
        let approved = fx
            .repo
            .list_audit(COMMUNITY, "onboarding_approved")
            .await
            .unwrap();
        let denied = fx
            .repo
            .list_audit(COMMUNITY, "onboarding_denied")
            .await
            .unwrap();
        assert_eq!(approved.len() + denied.len(), 1);
        assert_eq!(fx.gateway.direct_messages().len(), 1);
    }

    #[tokio::test]
    async fn click_on_decided_member_only_refreshes_message() {
        let fx = fixture().await;
        let settings = settings();

        handle_click(
            fx.repo.as_ref(),
            fx.gateway.as_ref(),
            &fx.oracle,
            &settings,
            COMMUNITY,
            &fx.message,
            Actor::user(APPROVER, "mod_abby"),
            ActionKind::Approve,
        )
        .await
        .unwrap();

        fx.gateway.give_roles(COMMUNITY, UserId(2), vec![RoleId(11)]);
        let visual = handle_click(
            fx.repo.as_ref(),
            fx.gateway.as_ref(),
            &fx.oracle,
            &settings,
            COMMUNITY,
            &fx.message,
            Actor::user(UserId(2), "mod_carol"),
            ActionKind::Deny,
        )
        .await
        .unwrap();

        // The original decision stands, attributed to the original decider.
        assert_eq!(visual.field(STATUS_FIELD), Some("approved"));
        assert_eq!(visual.field(APPROVED_BY_FIELD), Some("mod_abby"));

        // No second set of effects, no second decision audit.
        assert_eq!(fx.gateway.direct_messages().len(), 1);
        let approved = fx
            .repo
            .list_audit(COMMUNITY, "onboarding_approved")
            .await
            .unwrap();
        assert_eq!(approved.len(), 1);
    }

    #[tokio::test]
    async fn side_effect_failure_does_not_roll_back_the_decision() {
        let fx = fixture().await;
        fx.gateway.forbid_direct_messages();

        handle_click(
            fx.repo.as_ref(),
            fx.gateway.as_ref(),
            &fx.oracle,
            &settings(),
            COMMUNITY,
            &fx.message,
            Actor::user(APPROVER, "mod_abby"),
            ActionKind::Approve,
        )
        .await
        .unwrap();

        let record = fx.repo.get_member(MEMBER, COMMUNITY).await.unwrap().unwrap();
        assert_eq!(record.status, OnboardingStatus::Approved);

        let audits = fx
            .repo
            .list_audit(COMMUNITY, "onboarding_approved")
            .await
            .unwrap();
        assert_eq!(
            audits[0]
                .details
                .get("side_effect_failures")
                .and_then(|v| v.as_u64()),
            Some(1)
        );
    }

    #[tokio::test]
    async fn message_without_member_identity_is_rejected() {
        let fx = fixture().await;
        let mut message = fx.message.clone();
        if let Some(visual) = &mut message.visual {
            visual.fields.clear();
            visual.description = "no mention here".to_string();
        }

        let err = handle_click(
            fx.repo.as_ref(),
            fx.gateway.as_ref(),
            &fx.oracle,
            &settings(),
            COMMUNITY,
            &message,
            Actor::user(APPROVER, "mod_abby"),
            ActionKind::Approve,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, WardenError::NotFound(_)));
    }
}
