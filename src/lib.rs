pub mod analytics;
pub mod bookings;
pub mod completion;
pub mod config;
pub mod conversations;
pub mod db;
pub mod errors;
pub mod experiments;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod outcomes;
pub mod prompt;
pub mod scheduler;
pub mod scoring;
pub mod session;
pub mod signals;
pub mod stats;
pub mod tools;

use crate::analytics::Analytics;
use crate::bookings::BookingService;
use crate::completion::{AnthropicClient, CompletionService};
use crate::config::AppConfig;
use crate::conversations::ConversationService;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::experiments::ExperimentService;
use crate::notify::{notifier_from_config, Notifier};
use crate::orchestrator::Orchestrator;
use crate::outcomes::OutcomeTracker;
use crate::prompt::PromptBuilder;
use crate::scheduler::OutcomeSweeper;
use crate::tools::ToolRegistry;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Process-wide collaborators, built once from configuration by the entry point.
pub struct Runtime {
    pub config: AppConfig,
    pub db: Arc<Database>,
    pub experiments: ExperimentService,
    pub analytics: Analytics,
    pub tracker: OutcomeTracker,
    pub bookings: BookingService,
    pub sweeper: OutcomeSweeper,
    notifier: Arc<dyn Notifier>,
    prompts: Arc<PromptBuilder>,
}

impl Runtime {
    pub fn new(config: AppConfig) -> AppResult<Self> {
        let notifier = notifier_from_config(&config.notifications)?;
        Self::with_notifier(config, notifier)
    }

    pub fn with_notifier(config: AppConfig, notifier: Arc<dyn Notifier>) -> AppResult<Self> {
        let db = Arc::new(Database::new(&config.database.path)?);
        let prompts = Arc::new(PromptBuilder::load(config.prompt_path.as_deref())?);
        let tracker = OutcomeTracker::new(db.clone(), config.outcomes.stale_after_minutes);
        let sweeper = OutcomeSweeper::new(
            tracker.clone(),
            Duration::from_secs(config.outcomes.sweep_interval_minutes * 60),
        );
        let bookings = BookingService::new(db.clone(), tracker.clone(), config.scheduling.utm_source.clone());
        tracing::info!(
            database = %db.path().display(),
            model = %config.completion.model,
            notifications = config.notifications.is_deliverable(),
            "runtime initialized"
        );

        Ok(Self {
            experiments: ExperimentService::new(db.clone()),
            analytics: Analytics::new(db.clone()),
            config,
            db,
            tracker,
            bookings,
            sweeper,
            notifier,
            prompts,
        })
    }

    /// The configured completion provider.
    pub fn completion(&self) -> AppResult<Arc<dyn CompletionService>> {
        Ok(Arc::new(AnthropicClient::new(&self.config.completion)?))
    }

    /// Turn handler over the standard tool set and the given completion provider.
    pub fn conversations(&self, completion: Arc<dyn CompletionService>) -> AppResult<ConversationService> {
        let tools = ToolRegistry::standard(self.db.clone(), self.notifier.clone(), self.config.scheduling.clone())?;
        let orchestrator = Orchestrator::new(completion, Arc::new(tools), self.prompts.clone())
            .with_max_tool_rounds(self.config.completion.max_tool_rounds);
        Ok(ConversationService::new(self.db.clone(), orchestrator, self.tracker.clone()))
    }
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// JSON logs to a daily file under `log_dir`, or to stderr when none is configured.
pub fn init_tracing(log_dir: Option<&Path>) -> AppResult<()> {
    let Some(log_dir) = log_dir else {
        return tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .json()
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|error| AppError::Config(error.to_string()));
    };

    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "clara.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Config(error.to_string()))
}
