//! Tools the agent may invoke mid-conversation.

pub mod capture_lead;
pub mod catalog;
pub mod qualification;
pub mod roi;
pub mod validation;

use crate::completion::ToolSpec;
use crate::config::SchedulingConfig;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{ToolContext, ToolResult};
use crate::notify::Notifier;
use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

pub use capture_lead::CaptureLeadTool;
pub use catalog::{NavigateToPageTool, RecommendSolutionTool, ScheduleBriefingTool};
pub use qualification::GetQualificationTool;
pub use roi::CalculateRoiTool;

#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn spec(&self) -> ToolSpec;

    /// Runs with input that already passed the tool's schema. Never fails the turn.
    async fn call(&self, input: Value, context: &ToolContext) -> ToolResult;
}

struct RegisteredTool {
    spec: ToolSpec,
    schema: JSONSchema,
    handler: Arc<dyn ToolHandler>,
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The six sales tools wired to their collaborators.
    pub fn standard(db: Arc<Database>, notifier: Arc<dyn Notifier>, scheduling: SchedulingConfig) -> AppResult<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(CaptureLeadTool::new(db, notifier)))?;
        registry.register(Arc::new(CalculateRoiTool))?;
        registry.register(Arc::new(RecommendSolutionTool))?;
        registry.register(Arc::new(NavigateToPageTool))?;
        registry.register(Arc::new(ScheduleBriefingTool::new(scheduling)))?;
        registry.register(Arc::new(GetQualificationTool))?;
        Ok(registry)
    }

    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) -> AppResult<()> {
        let spec = handler.spec();
        if self.find(&spec.name).is_some() {
            return Err(AppError::Conflict(format!("tool {} is already registered", spec.name)));
        }
        let schema = validation::compile_schema(&spec.name, &spec.input_schema).map_err(AppError::Config)?;
        self.tools.push(RegisteredTool { spec, schema, handler });
        Ok(())
    }

    /// Specs in registration order, as sent to the completion provider.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|tool| tool.spec.clone()).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|tool| tool.spec.name.as_str()).collect()
    }

    fn find(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.iter().find(|tool| tool.spec.name == name)
    }

    /// Validates and runs one invocation; unknown tools and bad input become failed results.
    pub async fn execute(&self, name: &str, input: Value, context: &ToolContext) -> ToolResult {
        let Some(tool) = self.find(name) else {
            tracing::warn!(conversation_id = %context.conversation_id, tool = %name, "unknown tool requested");
            return ToolResult::failure(format!("Unknown tool: {}", name));
        };

        let errors = validation::input_errors(&tool.schema, &input);
        if !errors.is_empty() {
            tracing::warn!(
                conversation_id = %context.conversation_id,
                tool = %name,
                errors = ?errors,
                "tool input rejected"
            );
            return ToolResult::failure(format!("Invalid input for {}: {}", name, errors.join("; ")));
        }

        let result = tool.handler.call(input, context).await;
        tracing::info!(
            conversation_id = %context.conversation_id,
            tool = %name,
            success = result.success,
            display = result.display_to_user,
            "tool executed"
        );
        result
    }
}

/// Deserializes validated input into a handler's typed form.
pub(crate) fn parse_input<T: DeserializeOwned>(tool: &str, input: Value) -> Result<T, ToolResult> {
    serde_json::from_value(input).map_err(|err| ToolResult::failure(format!("Invalid input for {}: {}", tool, err)))
}
