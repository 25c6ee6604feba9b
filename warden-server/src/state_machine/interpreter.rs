//! Side-effect interpreter.
//!
//! Effects run after the status transition has committed, so a failure
//! here never changes the decision. Each effect is attempted exactly once
//! and failures are logged and counted, not retried: the member's status
//! is already authoritative and an operator can re-run the identity
//! operations by hand if needed.

use tracing::warn;

use crate::chat::{ChatGateway, Delivery};
use crate::state_machine::effect::SideEffect;
use crate::state_machine::state::CommunityId;

/// Execute every effect against the gateway. Returns the number that
/// failed (transport errors and platform refusals both count).
pub async fn apply_side_effects(
    gateway: &dyn ChatGateway,
    community_id: CommunityId,
    effects: &[SideEffect],
) -> usize {
    let mut failures = 0;

    for effect in effects {
        let outcome = match effect {
            SideEffect::SetNickname { user_id, nickname } => gateway
                .set_display_name(community_id, *user_id, nickname)
                .await,
            SideEffect::GrantRole { user_id, role_id } => {
                gateway.grant_role(community_id, *user_id, *role_id).await
            }
            SideEffect::Notify { user_id, message } => {
                gateway
                    .send_direct_message(*user_id, community_id, message)
                    .await
            }
        };

        match outcome {
            Ok(Delivery::Delivered) => {}
            Ok(Delivery::Forbidden) => {
                warn!(
                    community_id = %community_id,
                    ?effect,
                    "platform refused side effect"
                );
                failures += 1;
            }
            Err(err) => {
                warn!(
                    community_id = %community_id,
                    ?effect,
                    error = %err,
                    "side effect failed"
                );
                failures += 1;
            }
        }
    }

    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::fake::FakeGateway;
    use crate::state_machine::state::{RoleId, UserId};

    fn effects() -> Vec<SideEffect> {
        vec![
            SideEffect::SetNickname {
                user_id: UserId(42),
                nickname: "Ada Lovelace".to_string(),
            },
            SideEffect::GrantRole {
                user_id: UserId(42),
                role_id: RoleId(900),
            },
            SideEffect::Notify {
                user_id: UserId(42),
                message: "welcome".to_string(),
            },
        ]
    }

    #[tokio::test]
    async fn all_effects_run_against_the_gateway() {
        let gateway = FakeGateway::new();
        let failures = apply_side_effects(&gateway, CommunityId(7), &effects()).await;

        assert_eq!(failures, 0);
        assert_eq!(gateway.nicknames().len(), 1);
        assert_eq!(gateway.role_grants().len(), 1);
        assert_eq!(gateway.direct_messages().len(), 1);
    }

    #[tokio::test]
    async fn refusal_counts_as_failure_but_later_effects_still_run() {
        let gateway = FakeGateway::new();
        gateway.forbid_direct_messages();

        let all = vec![
            SideEffect::Notify {
                user_id: UserId(42),
                message: "welcome".to_string(),
            },
            SideEffect::GrantRole {
                user_id: UserId(42),
                role_id: RoleId(900),
            },
        ];
        let failures = apply_side_effects(&gateway, CommunityId(7), &all).await;

        assert_eq!(failures, 1);
        assert_eq!(gateway.role_grants().len(), 1);
    }
}
