//! Periodic reconciliation sweep.
//!
//! The sweep re-reads recent approval messages in each community's
//! approval channel and repairs any whose displayed status no longer
//! matches the store (missed click callbacks, crashed edits). Staleness is
//! decided by comparing the machine-readable `Status` field against the
//! authoritative status. Corrections are audited under `sync_*` actions so
//! they are distinguishable from actor-driven decisions.
//!
//! One failing message never stops the pass; a failure to read the channel
//! history does, since nothing useful can be decided without it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::actuator::recover_decider;
use crate::chat::ChatGateway;
use crate::config::CommunitySettings;
use crate::error::WardenError;
use crate::state_machine::decision::{decide, ActionKind, ApprovalAction};
use crate::state_machine::render::extract_user_id;
use crate::state_machine::repository::MemberRepository;
use crate::state_machine::state::{Actor, AuditEntry, CommunityId, OnboardingStatus};
use crate::AppState;

/// What one community pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Approval request messages inspected.
    pub checked: usize,
    /// Messages re-rendered because they had gone stale.
    pub updated: usize,
    /// Messages that could not be repaired.
    pub errors: usize,
}

fn sync_audit_action(status: OnboardingStatus) -> Option<&'static str> {
    match status {
        OnboardingStatus::Approved => Some("sync_approved"),
        OnboardingStatus::Denied => Some("sync_denied"),
        OnboardingStatus::Pending => None,
    }
}

/// Run one reconciliation pass over a community's approval channel.
pub async fn sweep_community(
    repo: &dyn MemberRepository,
    gateway: &dyn ChatGateway,
    settings: &CommunitySettings,
    community_id: CommunityId,
) -> Result<SweepReport, WardenError> {
    let mut report = SweepReport::default();

    let Some(channel_id) = settings.approval_channel_id else {
        return Ok(report);
    };

    let since = Utc::now() - settings.sweep.lookback();
    let messages = gateway.fetch_recent_messages(channel_id, since).await?;

    for message in messages {
        if !message.author_is_self {
            continue;
        }
        let Some(visual) = &message.visual else {
            continue;
        };
        if !visual.is_approval_request() {
            continue;
        }
        report.checked += 1;

        let Some(user_id) = extract_user_id(visual) else {
            warn!(
                community_id = %community_id,
                message_id = %message.message_id,
                "approval message has no recoverable member id, skipping"
            );
            continue;
        };

        let record = match repo.get_member(user_id, community_id).await {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(err) => {
                warn!(
                    community_id = %community_id,
                    user_id = %user_id,
                    error = %err,
                    "failed to load member during sweep"
                );
                report.errors += 1;
                continue;
            }
        };

        if !record.status.is_terminal() {
            continue;
        }
        if visual.displayed_status() == Some(record.status.status_key()) {
            continue;
        }

        // Stale: the store decided but the message still shows something
        // else. Re-render with the original decider when the audit log
        // knows them.
        let decider = match recover_decider(repo, community_id, user_id, record.status).await {
            Ok(name) => name,
            Err(err) => {
                warn!(
                    community_id = %community_id,
                    user_id = %user_id,
                    error = %err,
                    "failed to recover decider during sweep"
                );
                None
            }
        };
        let original_actor = decider.unwrap_or_else(|| Actor::sync_fallback().name);

        // Replay the matching action through the transition function; the
        // decided branch produces the corrected render and no effects.
        let kind = match record.status {
            OnboardingStatus::Approved => ActionKind::Approve,
            OnboardingStatus::Denied => ActionKind::Deny,
            OnboardingStatus::Pending => continue,
        };
        let action = ApprovalAction {
            kind,
            actor: Actor {
                id: None,
                name: original_actor.clone(),
            },
        };
        let decision = decide(record.status, &action, &record.snapshot(), settings);
        let corrected = decision.render;

        if let Err(err) = gateway
            .edit_message(channel_id, message.message_id, &corrected)
            .await
        {
            warn!(
                community_id = %community_id,
                message_id = %message.message_id,
                error = %err,
                "failed to repair stale approval message"
            );
            report.errors += 1;
            continue;
        }

        if let Some(action) = sync_audit_action(record.status) {
            repo.append_audit(&AuditEntry::new(
                community_id,
                Some(user_id),
                Some(Actor::sync_fallback().name),
                action,
                json!({
                    "message_id": message.message_id.to_string(),
                    "original_actor": original_actor,
                }),
            ))
            .await?;
        }

        info!(
            community_id = %community_id,
            user_id = %user_id,
            message_id = %message.message_id,
            status = %record.status,
            "repaired stale approval message"
        );
        report.updated += 1;
    }

    Ok(report)
}

/// Background loop driving per-community sweeps.
///
/// Wakes on a fixed tick and runs a pass for every community whose sweep
/// is enabled and whose own interval has elapsed, so communities with
/// different intervals coexist on one timer.
pub async fn sweep_loop(state: Arc<AppState>, tick: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut next_due: HashMap<CommunityId, Instant> = HashMap::new();

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {
                info!("sweep loop shutting down");
                return;
            }
        }

        let now = Instant::now();
        for community_id in state.settings.community_ids() {
            let settings = state.settings.get(community_id);
            if !settings.sweep.enabled {
                continue;
            }
            if next_due.get(&community_id).is_some_and(|due| now < *due) {
                continue;
            }
            next_due.insert(community_id, now + settings.sweep.interval());

            match sweep_community(
                state.repository.as_ref(),
                state.gateway.as_ref(),
                &settings,
                community_id,
            )
            .await
            {
                Ok(report) => {
                    if report.updated > 0 || report.errors > 0 {
                        info!(
                            community_id = %community_id,
                            checked = report.checked,
                            updated = report.updated,
                            errors = report.errors,
                            "sweep pass finished"
                        );
                    }
                }
                Err(err) => {
                    error!(
                        community_id = %community_id,
                        error = %err,
                        "sweep pass failed"
                    );
                }
            }
        }
    }
}
