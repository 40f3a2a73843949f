use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_BOOKING_URL: &str = "https://calendly.com/sdi-clarity/executive-briefing";
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub completion: CompletionConfig,
    pub notifications: NotificationConfig,
    pub scheduling: SchedulingConfig,
    pub outcomes: OutcomeConfig,
    pub database: DatabaseConfig,
    pub log_dir: Option<PathBuf>,
    pub prompt_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompletionConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub base_url: String,
    pub request_timeout_sec: u64,
    /// Tool rounds honoured per turn; later tool requests are ignored and the turn closes.
    pub max_tool_rounds: usize,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 4096,
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_sec: 120,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub recipient: Option<String>,
    pub sender: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            recipient: None,
            sender: "Clara <clara@sdiclarity.ai>".to_string(),
        }
    }
}

impl NotificationConfig {
    pub fn is_deliverable(&self) -> bool {
        self.enabled && self.api_key.is_some() && self.recipient.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulingConfig {
    pub booking_url: String,
    pub utm_source: String,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            booking_url: DEFAULT_BOOKING_URL.to_string(),
            utm_source: "clara".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutcomeConfig {
    pub stale_after_minutes: i64,
    pub sweep_interval_minutes: u64,
}

impl Default for OutcomeConfig {
    fn default() -> Self {
        Self {
            stale_after_minutes: 30,
            sweep_interval_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/clara.db"),
        }
    }
}

impl AppConfig {
    /// Reads the optional YAML file, then layers process environment on top.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .map_err(|error| AppError::Config(format!("{}: {}", path.display(), error)))?;
                serde_yaml::from_str::<AppConfig>(&raw)?
            }
            None => AppConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|value| value.trim().to_string()).filter(|value| !value.is_empty());

        if let Some(value) = get("ANTHROPIC_API_KEY") {
            self.completion.api_key = Some(value);
        }
        if let Some(value) = get("ANTHROPIC_MODEL") {
            self.completion.model = value;
        }
        if let Some(value) = get("ANTHROPIC_BASE_URL") {
            self.completion.base_url = value;
        }
        if let Some(value) = get("RESEND_API_KEY") {
            self.notifications.api_key = Some(value);
        }
        if let Some(value) = get("NOTIFICATION_EMAIL") {
            self.notifications.recipient = Some(value);
        }
        if let Some(value) = get("CLARA_DB_PATH") {
            self.database.path = PathBuf::from(value);
        }
        if let Some(value) = get("CLARA_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = get("CLARA_PROMPT_PATH") {
            self.prompt_path = Some(PathBuf::from(value));
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.completion.max_tokens == 0 {
            return Err(AppError::Config("completion.maxTokens must be positive".to_string()));
        }
        if self.completion.max_tool_rounds == 0 {
            return Err(AppError::Config("completion.maxToolRounds must be positive".to_string()));
        }
        if self.outcomes.stale_after_minutes <= 0 {
            return Err(AppError::Config("outcomes.staleAfterMinutes must be positive".to_string()));
        }
        if self.outcomes.sweep_interval_minutes == 0 {
            return Err(AppError::Config("outcomes.sweepIntervalMinutes must be positive".to_string()));
        }
        url::Url::parse(&self.scheduling.booking_url)
            .map_err(|error| AppError::Config(format!("scheduling.bookingUrl: {}", error)))?;
        url::Url::parse(&self.completion.base_url)
            .map_err(|error| AppError::Config(format!("completion.baseUrl: {}", error)))?;
        Ok(())
    }
}
