use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    Visitor,
    Agent,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Visitor => "visitor",
            Self::Agent => "agent",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "visitor" | "user" => Some(Self::Visitor),
            "agent" | "assistant" => Some(Self::Agent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub session_id: String,
    pub lead_id: Option<String>,
    pub variant_id: Option<String>,
    pub current_page: Option<String>,
    pub lead_score: Option<u32>,
    pub lead_quality: Option<LeadQuality>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub tool_calls: Option<serde_json::Value>,
    pub tool_results: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LeadQuality {
    Hot,
    Warm,
    Cold,
    #[default]
    Unknown,
}

impl LeadQuality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "hot" => Self::Hot,
            "warm" => Self::Warm,
            "cold" => Self::Cold,
            _ => Self::Unknown,
        }
    }

    pub fn warrants_notification(self) -> bool {
        matches!(self, Self::Hot | Self::Warm)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub company_size: Option<String>,
    pub industry: Option<String>,
    pub role: Option<String>,
    pub role_level: Option<String>,
    pub primary_interest: Option<String>,
    pub pain_points: Vec<String>,
    pub hesitations: Vec<String>,
    pub decision_criteria: Vec<String>,
    pub timeline: Option<String>,
    pub company_fit_score: u32,
    pub authority_score: u32,
    pub intent_score: u32,
    pub total_score: u32,
    pub quality: LeadQuality,
    /// Conversation the lead was first captured in.
    pub source: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    pub fn display_name(&self) -> Option<String> {
        let first = self.first_name.as_deref()?.trim();
        if first.is_empty() {
            return None;
        }
        let last = self.last_name.as_deref().unwrap_or_default().trim();
        Some(format!("{} {}", first, last).trim().to_string())
    }
}

/// Scalar lead fields; `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LeadFields {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub company_size: Option<String>,
    pub industry: Option<String>,
    pub role: Option<String>,
    pub role_level: Option<String>,
    pub primary_interest: Option<String>,
    pub timeline: Option<String>,
}

impl LeadFields {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadListField {
    PainPoints,
    Hesitations,
    DecisionCriteria,
}

impl LeadListField {
    pub fn column(self) -> &'static str {
        match self {
            Self::PainPoints => "pain_points_json",
            Self::Hesitations => "hesitations_json",
            Self::DecisionCriteria => "decision_criteria_json",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

impl ExperimentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Draft, Self::Active)
                | (Self::Paused, Self::Active)
                | (Self::Active, Self::Paused)
                | (Self::Active, Self::Completed)
                | (Self::Paused, Self::Completed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Replace,
    Append,
    Prepend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptMutation {
    #[serde(rename = "type")]
    pub kind: MutationKind,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub content: String,
}

impl PromptMutation {
    pub fn noop() -> Self {
        Self {
            kind: MutationKind::Replace,
            section: None,
            content: String::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.content.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub id: String,
    pub experiment_id: String,
    pub name: String,
    pub description: Option<String>,
    pub weight: u32,
    pub mutation: PromptMutation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub status: ExperimentStatus,
    pub target_size: u32,
    pub variants: Vec<Variant>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Experiment {
    pub fn variant_by_name(&self, name: &str) -> Option<&Variant> {
        self.variants.iter().find(|variant| variant.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewExperiment {
    pub name: String,
    pub description: Option<String>,
    pub target_size: Option<u32>,
    pub variants: Vec<NewVariant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewVariant {
    pub name: String,
    pub description: Option<String>,
    pub weight: u32,
    #[serde(alias = "promptModification")]
    pub mutation: PromptMutation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeLabel {
    Scheduled,
    Qualified,
    Interested,
    Bounced,
}

impl OutcomeLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Qualified => "QUALIFIED",
            Self::Interested => "INTERESTED",
            Self::Bounced => "BOUNCED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "SCHEDULED" => Some(Self::Scheduled),
            "QUALIFIED" => Some(Self::Qualified),
            "INTERESTED" => Some(Self::Interested),
            "BOUNCED" => Some(Self::Bounced),
            _ => None,
        }
    }

    /// Experiment conversion events.
    pub fn is_conversion(self) -> bool {
        matches!(self, Self::Scheduled | Self::Qualified)
    }

    pub const ALL: [OutcomeLabel; 4] = [Self::Scheduled, Self::Qualified, Self::Interested, Self::Bounced];
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub conversation_id: String,
    pub variant_id: Option<String>,
    pub label: OutcomeLabel,
    pub classified_at: DateTime<Utc>,
    pub message_count: u32,
    pub duration_sec: i64,
    pub visitor_role: Option<String>,
    pub company_size: Option<String>,
    pub industry: Option<String>,
    pub primary_interest: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub message: String,
    pub display_to_user: bool,
}

impl ToolResult {
    pub fn ok(data: serde_json::Value, message: impl Into<String>, display_to_user: bool) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: message.into(),
            display_to_user,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: message.into(),
            display_to_user: false,
        }
    }

    pub fn should_display(&self) -> bool {
        self.display_to_user && self.data.is_some()
    }
}

/// Per-request context handed to every tool handler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolContext {
    pub conversation_id: String,
    pub session_id: String,
    pub lead_id: Option<String>,
    pub experiment_id: Option<String>,
    pub variant_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Text { content: String },
    ToolResult { tool: ToolResult },
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Scheduled,
    Canceled,
}

impl BookingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: String,
    pub external_event_id: String,
    pub conversation_id: Option<String>,
    pub email: Option<String>,
    pub event_type: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveExperimentSummary {
    pub id: String,
    pub name: String,
    pub variant_count: usize,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub active_experiment: Option<ActiveExperimentSummary>,
    pub total_conversations: u64,
    pub total_leads: u64,
    pub total_outcomes: u64,
    pub timestamp: DateTime<Utc>,
}
