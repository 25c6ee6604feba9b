//! Process configuration (environment) and per-community settings.
//!
//! Process-level knobs come from the environment, like every other
//! deployment input. Community settings are operator-managed data: they
//! arrive as JSON (one entry per community) and are validated when loaded,
//! which is the configuration-save boundary. Submission-time code trusts
//! them.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::state_machine::state::{ChannelId, CommunityId, RoleId};

/// Hard cap on configured onboarding field descriptors. Enforced when
/// settings are loaded, not at submission time.
pub const MAX_ONBOARDING_FIELDS: usize = 5;

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    pub state_dir: PathBuf,
    /// Path to the per-community settings JSON.
    pub settings_path: PathBuf,
    pub chat_api_base_url: String,
    pub chat_api_token: String,
    /// How often the sweep loop wakes up to check which communities are due.
    pub sweep_tick: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port = env::var("WARDEN_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("WARDEN_PORT must be a valid port number")?;

        let state_dir = env::var("WARDEN_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let settings_path = env::var("WARDEN_SETTINGS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("communities.json"));

        let chat_api_base_url = env::var("CHAT_API_BASE_URL")
            .context("CHAT_API_BASE_URL environment variable is required")?;

        let chat_api_token = env::var("CHAT_API_TOKEN")
            .context("CHAT_API_TOKEN environment variable is required")?;

        let sweep_tick_secs = env::var("WARDEN_SWEEP_TICK_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse::<u64>()
            .context("WARDEN_SWEEP_TICK_SECS must be a valid number of seconds")?;

        Ok(Config {
            port,
            state_dir,
            settings_path,
            chat_api_base_url,
            chat_api_token,
            sweep_tick: Duration::from_secs(sweep_tick_secs),
        })
    }
}

/// How an application leaves the pending state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    /// Submissions are approved immediately, no request message is posted.
    Auto,
    /// Submissions post an approval request and wait for an approver.
    Manual,
}

/// One configured onboarding form field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub label: String,
    #[serde(default = "default_field_max_length")]
    pub max_length: usize,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_field_max_length() -> usize {
    100
}

fn default_true() -> bool {
    true
}

/// Reconciliation sweep knobs. Disabled per community by default.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SweepSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval_minutes")]
    pub interval_minutes: u64,
    #[serde(default = "default_sweep_lookback_hours")]
    pub lookback_hours: u64,
}

fn default_sweep_interval_minutes() -> u64 {
    15
}

fn default_sweep_lookback_hours() -> u64 {
    24
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: default_sweep_interval_minutes(),
            lookback_hours: default_sweep_lookback_hours(),
        }
    }
}

impl SweepSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }

    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::hours(self.lookback_hours as i64)
    }
}

/// Per-community settings, read-only to the onboarding core.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommunitySettings {
    #[serde(default = "default_approval_mode")]
    pub approval_mode: ApprovalMode,
    #[serde(default)]
    pub approver_role_ids: Vec<RoleId>,
    #[serde(default)]
    pub onboarded_role_id: Option<RoleId>,
    #[serde(default)]
    pub approval_channel_id: Option<ChannelId>,
    #[serde(default = "default_true")]
    pub set_nickname: bool,
    #[serde(default = "default_true")]
    pub grant_role: bool,
    #[serde(default = "default_true")]
    pub prevent_resubmission: bool,
    #[serde(default)]
    pub nickname_template: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
    #[serde(default)]
    pub sweep: SweepSettings,
}

fn default_approval_mode() -> ApprovalMode {
    ApprovalMode::Auto
}

impl Default for CommunitySettings {
    fn default() -> Self {
        Self {
            approval_mode: ApprovalMode::Auto,
            approver_role_ids: Vec::new(),
            onboarded_role_id: None,
            approval_channel_id: None,
            set_nickname: true,
            grant_role: true,
            prevent_resubmission: true,
            nickname_template: None,
            fields: Vec::new(),
            sweep: SweepSettings::default(),
        }
    }
}

impl CommunitySettings {
    /// Field descriptors in effect: configured ones, or the stock
    /// first/last name pair when none are configured.
    pub fn effective_fields(&self) -> Vec<FieldDescriptor> {
        if self.fields.is_empty() {
            default_onboarding_fields()
        } else {
            self.fields.clone()
        }
    }

    fn validate(&self, community_id: CommunityId) -> Result<()> {
        if self.fields.len() > MAX_ONBOARDING_FIELDS {
            bail!(
                "community {} configures {} onboarding fields, maximum is {}",
                community_id,
                self.fields.len(),
                MAX_ONBOARDING_FIELDS
            );
        }

        for field in &self.fields {
            if field.name.trim().is_empty() {
                bail!("community {} has a field descriptor with an empty name", community_id);
            }
        }

        if self.approval_mode == ApprovalMode::Manual && self.approval_channel_id.is_none() {
            bail!(
                "community {} uses manual approval but has no approval channel configured",
                community_id
            );
        }

        Ok(())
    }
}

/// Stock field descriptors used when a community configures none.
pub fn default_onboarding_fields() -> Vec<FieldDescriptor> {
    vec![
        FieldDescriptor {
            name: "first_name".to_string(),
            label: "First Name".to_string(),
            max_length: 50,
            required: true,
        },
        FieldDescriptor {
            name: "last_name".to_string(),
            label: "Last Name".to_string(),
            max_length: 50,
            required: true,
        },
    ]
}

#[derive(Debug, Deserialize)]
struct CommunityEntry {
    community_id: CommunityId,
    #[serde(default)]
    settings: CommunitySettings,
}

/// All known communities and their settings.
#[derive(Debug)]
pub struct SettingsMap {
    communities: HashMap<CommunityId, CommunitySettings>,
}

impl SettingsMap {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let entries: Vec<CommunityEntry> =
            serde_json::from_str(raw).context("settings file is not valid community JSON")?;

        let mut communities = HashMap::new();
        for entry in entries {
            entry.settings.validate(entry.community_id)?;
            if communities
                .insert(entry.community_id, entry.settings)
                .is_some()
            {
                bail!("duplicate settings entry for community {}", entry.community_id);
            }
        }

        Ok(Self { communities })
    }

    pub fn from_entries(
        entries: impl IntoIterator<Item = (CommunityId, CommunitySettings)>,
    ) -> Self {
        Self {
            communities: entries.into_iter().collect(),
        }
    }

    /// Settings for a community, defaults if it has never been configured.
    pub fn get(&self, community_id: CommunityId) -> CommunitySettings {
        self.communities
            .get(&community_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn community_ids(&self) -> Vec<CommunityId> {
        self.communities.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_applies_defaults() {
        let map = SettingsMap::parse(r#"[{"community_id": 7, "settings": {}}]"#).unwrap();
        let settings = map.get(CommunityId(7));

        assert_eq!(settings.approval_mode, ApprovalMode::Auto);
        assert!(settings.set_nickname);
        assert!(settings.grant_role);
        assert!(!settings.sweep.enabled);
        assert_eq!(settings.sweep.interval_minutes, 15);
        assert_eq!(settings.sweep.lookback_hours, 24);
    }

    #[test]
    fn unknown_community_gets_defaults() {
        let map = SettingsMap::parse("[]").unwrap();
        let settings = map.get(CommunityId(99));
        assert_eq!(settings, CommunitySettings::default());
    }

    #[test]
    fn manual_mode_requires_approval_channel() {
        let raw = r#"[{"community_id": 7, "settings": {"approval_mode": "manual"}}]"#;
        assert!(SettingsMap::parse(raw).is_err());

        let raw = r#"[{"community_id": 7, "settings": {
            "approval_mode": "manual", "approval_channel_id": 500
        }}]"#;
        assert!(SettingsMap::parse(raw).is_ok());
    }

    #[test]
    fn field_descriptor_cap_is_enforced_at_load() {
        let fields: Vec<String> = (0..6)
            .map(|i| format!(r#"{{"name": "f{i}", "label": "F{i}"}}"#))
            .collect();
        let raw = format!(
            r#"[{{"community_id": 7, "settings": {{"fields": [{}]}}}}]"#,
            fields.join(",")
        );

        let err = SettingsMap::parse(&raw).unwrap_err();
        assert!(err.to_string().contains("maximum is 5"));
    }

    #[test]
    fn effective_fields_fall_back_to_stock_pair() {
        let settings = CommunitySettings::default();
        let fields = settings.effective_fields();

        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].name, "first_name");
        assert_eq!(fields[1].name, "last_name");
        assert_eq!(fields[0].max_length, 50);
        assert!(fields[0].required);
    }

    #[test]
    fn duplicate_community_entries_are_rejected() {
        let raw = r#"[
            {"community_id": 7, "settings": {}},
            {"community_id": 7, "settings": {}}
        ]"#;
        assert!(SettingsMap::parse(raw).is_err());
    }
}
