//! Chat platform gateway.
//!
//! Everything that touches the platform API goes through `ChatGateway`, so
//! the core can run against `FakeGateway` in tests and `RestChatGateway`
//! in production. Identity operations distinguish a hard transport failure
//! from the platform refusing us (`Delivery::Forbidden`, e.g. a member
//! with direct messages disabled) because the latter is an expected
//! per-member condition, not an outage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::state_machine::render::VisualSpec;
use crate::state_machine::state::{ChannelId, CommunityId, MessageId, RoleId, UserId};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("chat transport error: {0}")]
    Transport(String),

    #[error("chat API returned {status}: {context}")]
    Status { status: u16, context: String },
}

impl GatewayError {
    fn transport(context: &str, err: reqwest::Error) -> Self {
        Self::Transport(format!("{context}: {err}"))
    }
}

/// Outcome of a best-effort identity operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The platform refused the operation for this member (closed DMs,
    /// missing permission on this target). Logged and counted as a
    /// failure, never retried.
    Forbidden,
}

/// A message as fetched back from a channel.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    /// Whether this service's own account authored the message.
    pub author_is_self: bool,
    /// Parsed structured content, absent for plain-text messages.
    pub visual: Option<VisualSpec>,
}

#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// Messages in a channel no older than `since`, newest last.
    async fn fetch_recent_messages(
        &self,
        channel_id: ChannelId,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChatMessage>, GatewayError>;

    async fn fetch_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<Option<ChatMessage>, GatewayError>;

    async fn post_message(
        &self,
        channel_id: ChannelId,
        visual: &VisualSpec,
    ) -> Result<MessageId, GatewayError>;

    async fn edit_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        visual: &VisualSpec,
    ) -> Result<(), GatewayError>;

    async fn send_direct_message(
        &self,
        user_id: UserId,
        community_id: CommunityId,
        text: &str,
    ) -> Result<Delivery, GatewayError>;

    async fn set_display_name(
        &self,
        community_id: CommunityId,
        user_id: UserId,
        name: &str,
    ) -> Result<Delivery, GatewayError>;

    async fn grant_role(
        &self,
        community_id: CommunityId,
        user_id: UserId,
        role_id: RoleId,
    ) -> Result<Delivery, GatewayError>;

    /// Role ids currently held by a member of the community.
    async fn actor_role_ids(
        &self,
        community_id: CommunityId,
        user_id: UserId,
    ) -> Result<Vec<RoleId>, GatewayError>;
}

/// Authorization check for approval actions.
#[async_trait]
pub trait PermissionOracle: Send + Sync {
    async fn is_approver(
        &self,
        actor_id: UserId,
        community_id: CommunityId,
    ) -> Result<bool, GatewayError>;
}

/// `PermissionOracle` backed by the community's configured approver roles.
///
/// An empty approver set means nobody can approve; misconfiguration fails
/// closed rather than open.
pub struct RoleSetOracle {
    gateway: std::sync::Arc<dyn ChatGateway>,
    settings: std::sync::Arc<crate::config::SettingsMap>,
}

impl RoleSetOracle {
    pub fn new(
        gateway: std::sync::Arc<dyn ChatGateway>,
        settings: std::sync::Arc<crate::config::SettingsMap>,
    ) -> Self {
        Self { gateway, settings }
    }
}

#[async_trait]
impl PermissionOracle for RoleSetOracle {
    async fn is_approver(
        &self,
        actor_id: UserId,
        community_id: CommunityId,
    ) -> Result<bool, GatewayError> {
        let approver_roles = self.settings.get(community_id).approver_role_ids;
        if approver_roles.is_empty() {
            return Ok(false);
        }

        let held = self.gateway.actor_role_ids(community_id, actor_id).await?;
        Ok(held.iter().any(|role| approver_roles.contains(role)))
    }
}

#[derive(Debug, Serialize)]
struct PostMessageRequest<'a> {
    visual: &'a VisualSpec,
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    message_id: MessageId,
}

#[derive(Debug, Deserialize)]
struct MessageEnvelope {
    message_id: MessageId,
    channel_id: ChannelId,
    author_is_self: bool,
    visual: Option<VisualSpec>,
}

impl From<MessageEnvelope> for ChatMessage {
    fn from(envelope: MessageEnvelope) -> Self {
        ChatMessage {
            message_id: envelope.message_id,
            channel_id: envelope.channel_id,
            author_is_self: envelope.author_is_self,
            visual: envelope.visual,
        }
    }
}

#[derive(Debug, Serialize)]
struct DirectMessageRequest<'a> {
    community_id: CommunityId,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct DisplayNameRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct RoleListResponse {
    role_ids: Vec<RoleId>,
}

/// HTTP implementation of `ChatGateway` against the platform's REST API.
#[derive(Clone)]
pub struct RestChatGateway {
    client: Client,
    base_url: String,
    token: String,
}

impl RestChatGateway {
    pub fn new(base_url: String, token: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check_status(
        response: reqwest::Response,
        context: &str,
    ) -> Result<reqwest::Response, GatewayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(GatewayError::Status {
            status: status.as_u16(),
            context: format!("{context}: {body}"),
        })
    }

    /// Like `check_status` but maps 403 to `Delivery::Forbidden`.
    async fn check_delivery(
        response: reqwest::Response,
        context: &str,
    ) -> Result<Delivery, GatewayError> {
        if response.status().as_u16() == 403 {
            return Ok(Delivery::Forbidden);
        }
        Self::check_status(response, context).await?;
        Ok(Delivery::Delivered)
    }
}

#[async_trait]
impl ChatGateway for RestChatGateway {
    async fn fetch_recent_messages(
        &self,
        channel_id: ChannelId,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChatMessage>, GatewayError> {
        let url = self.url(&format!("/channels/{channel_id}/messages"));
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("since", since.to_rfc3339())])
            .send()
            .await
            .map_err(|e| GatewayError::transport("failed to fetch channel messages", e))?;

        let response = Self::check_status(response, "fetching channel messages").await?;
        let envelopes: Vec<MessageEnvelope> = response
            .json()
            .await
            .map_err(|e| GatewayError::transport("failed to parse channel messages", e))?;

        Ok(envelopes.into_iter().map(ChatMessage::from).collect())
    }

    async fn fetch_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<Option<ChatMessage>, GatewayError> {
        let url = self.url(&format!("/channels/{channel_id}/messages/{message_id}"));
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| GatewayError::transport("failed to fetch message", e))?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }

        let response = Self::check_status(response, "fetching message").await?;
        let envelope: MessageEnvelope = response
            .json()
            .await
            .map_err(|e| GatewayError::transport("failed to parse message", e))?;

        Ok(Some(envelope.into()))
    }

    async fn post_message(
        &self,
        channel_id: ChannelId,
        visual: &VisualSpec,
    ) -> Result<MessageId, GatewayError> {
        let url = self.url(&format!("/channels/{channel_id}/messages"));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&PostMessageRequest { visual })
            .send()
            .await
            .map_err(|e| GatewayError::transport("failed to post message", e))?;

        let response = Self::check_status(response, "posting message").await?;
        let posted: PostMessageResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::transport("failed to parse post response", e))?;

        info!(channel_id = %channel_id, message_id = %posted.message_id, "posted approval message");
        Ok(posted.message_id)
    }

    async fn edit_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        visual: &VisualSpec,
    ) -> Result<(), GatewayError> {
        let url = self.url(&format!("/channels/{channel_id}/messages/{message_id}"));
        let response = self
            .client
            .patch(&url)
            .bearer_auth(&self.token)
            .json(&PostMessageRequest { visual })
            .send()
            .await
            .map_err(|e| GatewayError::transport("failed to edit message", e))?;

        Self::check_status(response, "editing message").await?;
        Ok(())
    }

    async fn send_direct_message(
        &self,
        user_id: UserId,
        community_id: CommunityId,
        text: &str,
    ) -> Result<Delivery, GatewayError> {
        let url = self.url(&format!("/users/{user_id}/messages"));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&DirectMessageRequest { community_id, text })
            .send()
            .await
            .map_err(|e| GatewayError::transport("failed to send direct message", e))?;

        Self::check_delivery(response, "sending direct message").await
    }

    async fn set_display_name(
        &self,
        community_id: CommunityId,
        user_id: UserId,
        name: &str,
    ) -> Result<Delivery, GatewayError> {
        let url = self.url(&format!("/communities/{community_id}/members/{user_id}/nick"));
        let response = self
            .client
            .patch(&url)
            .bearer_auth(&self.token)
            .json(&DisplayNameRequest { name })
            .send()
            .await
            .map_err(|e| GatewayError::transport("failed to set display name", e))?;

        Self::check_delivery(response, "setting display name").await
    }

    async fn grant_role(
        &self,
        community_id: CommunityId,
        user_id: UserId,
        role_id: RoleId,
    ) -> Result<Delivery, GatewayError> {
        let url = self.url(&format!(
            "/communities/{community_id}/members/{user_id}/roles/{role_id}"
        ));
        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| GatewayError::transport("failed to grant role", e))?;

        Self::check_delivery(response, "granting role").await
    }

    async fn actor_role_ids(
        &self,
        community_id: CommunityId,
        user_id: UserId,
    ) -> Result<Vec<RoleId>, GatewayError> {
        let url = self.url(&format!("/communities/{community_id}/members/{user_id}/roles"));
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| GatewayError::transport("failed to fetch member roles", e))?;

        let response = Self::check_status(response, "fetching member roles").await?;
        let roles: RoleListResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::transport("failed to parse member roles", e))?;

        Ok(roles.role_ids)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::fake::FakeGateway;
    use super::*;
    use crate::config::{CommunitySettings, SettingsMap};

    fn oracle_with(settings: CommunitySettings, gateway: Arc<FakeGateway>) -> RoleSetOracle {
        let map = SettingsMap::from_entries([(CommunityId(7), settings)]);
        RoleSetOracle::new(gateway, Arc::new(map))
    }

    #[tokio::test]
    async fn empty_approver_set_fails_closed() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.give_roles(CommunityId(7), UserId(1), vec![RoleId(10)]);
        let oracle = oracle_with(CommunitySettings::default(), gateway);

        assert!(!oracle.is_approver(UserId(1), CommunityId(7)).await.unwrap());
    }

    #[tokio::test]
    async fn approver_role_overlap_grants_permission() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.give_roles(CommunityId(7), UserId(1), vec![RoleId(10), RoleId(11)]);
        gateway.give_roles(CommunityId(7), UserId(2), vec![RoleId(12)]);

        let settings = CommunitySettings {
            approver_role_ids: vec![RoleId(11)],
            ..CommunitySettings::default()
        };
        let oracle = oracle_with(settings, gateway);

        assert!(oracle.is_approver(UserId(1), CommunityId(7)).await.unwrap());
        assert!(!oracle.is_approver(UserId(2), CommunityId(7)).await.unwrap());
    }
}
