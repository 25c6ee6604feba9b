//! Request renderer: deterministic visual representation of an approval
//! request for a given status and member snapshot.
//!
//! The same `VisualSpec` is used to display the message and to read it
//! back: the sweep compares the machine-readable `Status` field against
//! the authoritative store to detect staleness, instead of sniffing the
//! display title for marker substrings. Given equal inputs the output is
//! identical, so staleness can be decided without side effects.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::state::{MemberSnapshot, OnboardingStatus, UserId};

/// Name of the machine-readable status field.
pub const STATUS_FIELD: &str = "Status";

/// Name of the immutable member-id field used for extraction.
pub const USER_ID_FIELD: &str = "User ID";

pub const APPROVED_BY_FIELD: &str = "Approved By";
pub const DENIED_BY_FIELD: &str = "Denied By";

/// Accent color keyed by status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusColor {
    Blue,
    Green,
    Red,
}

/// One structured field in the rendered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// The rendered representation of an approval request.
///
/// This is pure data: the gateway serializes it onto the wire, and the
/// sweep parses it back out of fetched messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualSpec {
    pub title: String,
    pub color: StatusColor,
    pub description: String,
    pub fields: Vec<VisualField>,
    /// Approve/deny controls are attached only while pending.
    pub controls_enabled: bool,
}

impl VisualSpec {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.as_str())
    }

    /// The machine-readable status key this message currently displays.
    pub fn displayed_status(&self) -> Option<&str> {
        self.field(STATUS_FIELD)
    }

    /// Whether this message is one of ours: an approval request carries
    /// both the structured status and member-id fields.
    pub fn is_approval_request(&self) -> bool {
        self.field(STATUS_FIELD).is_some() && self.field(USER_ID_FIELD).is_some()
    }
}

/// Decision attribution shown on a decided request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecisionMeta {
    pub decided_by: Option<String>,
}

impl DecisionMeta {
    pub fn by(name: impl Into<String>) -> Self {
        Self {
            decided_by: Some(name.into()),
        }
    }
}

/// Render the approval request for a status and member snapshot.
pub fn render(status: OnboardingStatus, snapshot: &MemberSnapshot, meta: &DecisionMeta) -> VisualSpec {
    let (title, color) = match status {
        OnboardingStatus::Pending => ("Onboarding Approval Request", StatusColor::Blue),
        OnboardingStatus::Approved => ("Onboarding Request Approved", StatusColor::Green),
        OnboardingStatus::Denied => ("Onboarding Request Denied", StatusColor::Red),
    };

    let mut fields = vec![
        VisualField {
            name: STATUS_FIELD.to_string(),
            value: status.status_key().to_string(),
            inline: true,
        },
        VisualField {
            name: USER_ID_FIELD.to_string(),
            value: snapshot.user_id.to_string(),
            inline: true,
        },
    ];

    // BTreeMap iteration keeps attribute order stable across renders.
    for (name, value) in &snapshot.fields {
        fields.push(VisualField {
            name: name.clone(),
            value: value.clone(),
            inline: true,
        });
    }

    if let Some(decided_by) = &meta.decided_by {
        let name = match status {
            OnboardingStatus::Approved => Some(APPROVED_BY_FIELD),
            OnboardingStatus::Denied => Some(DENIED_BY_FIELD),
            OnboardingStatus::Pending => None,
        };
        if let Some(name) = name {
            fields.push(VisualField {
                name: name.to_string(),
                value: decided_by.clone(),
                inline: false,
            });
        }
    }

    VisualSpec {
        title: title.to_string(),
        color,
        description: format!(
            "Onboarding application from <@{}> ({}).",
            snapshot.user_id, snapshot.username
        ),
        fields,
        controls_enabled: status == OnboardingStatus::Pending,
    }
}

fn mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<@(\d+)>").expect("mention pattern is valid"))
}

/// Recover the target member id from a rendered message.
///
/// The structured `User ID` field is authoritative; parsing the first
/// `<@id>` mention out of the description is a best-effort fallback for
/// messages rendered by older versions. Returns `None` when neither is
/// present, in which case callers skip the message.
pub fn extract_user_id(visual: &VisualSpec) -> Option<UserId> {
    if let Some(value) = visual.field(USER_ID_FIELD) {
        if let Ok(id) = value.trim().parse::<u64>() {
            return Some(UserId(id));
        }
    }

    mention_re()
        .captures(&visual.description)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .map(UserId)
}
