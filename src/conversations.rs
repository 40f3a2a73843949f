//! Turn handling around the orchestrator: conversation lookup, variant assignment,
//! persistence of both sides of the turn and outcome refresh.

use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::experiments::ExperimentService;
use crate::models::{Conversation, Message, MessageRole, OutcomeLabel, PromptMutation, ToolContext, ToolResult};
use crate::orchestrator::{AgentContext, EventSink, Orchestrator};
use crate::outcomes::OutcomeTracker;
use crate::session::{new_session_id, SessionLocks};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub message: String,
    pub session_id: Option<String>,
    pub current_page: Option<String>,
    pub company_name: Option<String>,
    pub visitor_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnSummary {
    pub session_id: String,
    pub conversation_id: String,
    pub reply: String,
    pub tool_results: Vec<ToolResult>,
    pub outcome: Option<OutcomeLabel>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationHistory {
    pub session_id: String,
    pub conversation_id: String,
    pub messages: Vec<Message>,
}

struct VariantContext {
    experiment_id: Option<String>,
    variant_name: Option<String>,
    mutation: Option<PromptMutation>,
}

pub struct ConversationService {
    db: Arc<Database>,
    experiments: ExperimentService,
    orchestrator: Orchestrator,
    tracker: OutcomeTracker,
    locks: SessionLocks,
}

impl ConversationService {
    pub fn new(db: Arc<Database>, orchestrator: Orchestrator, tracker: OutcomeTracker) -> Self {
        Self {
            experiments: ExperimentService::new(db.clone()),
            db,
            orchestrator,
            tracker,
            locks: SessionLocks::new(),
        }
    }

    /// Runs one visitor turn end to end.
    ///
    /// The visitor message is stored before the completion starts, so an upstream failure
    /// leaves it in place and stores no agent message.
    pub async fn handle_turn(&self, request: TurnRequest, sink: &mut dyn EventSink) -> AppResult<TurnSummary> {
        let utterance = request.message.trim();
        if utterance.is_empty() {
            return Err(AppError::InvalidInput("message is required".to_string()));
        }
        let session_id = request
            .session_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(new_session_id);

        let _turn = self.locks.acquire(&session_id).await;
        let conversation = self.open_conversation(&session_id, request.current_page.as_deref())?;
        let history = self.db.list_messages(&conversation.id)?;
        self.db
            .insert_message(&conversation.id, MessageRole::Visitor, utterance, None, None)?;

        let variant = self.variant_context(&conversation)?;
        let context = AgentContext {
            tool: ToolContext {
                conversation_id: conversation.id.clone(),
                session_id: session_id.clone(),
                lead_id: conversation.lead_id.clone(),
                experiment_id: variant.experiment_id,
                variant_name: variant.variant_name,
            },
            current_page: request.current_page.clone().or(conversation.current_page.clone()),
            company_name: request.company_name.clone(),
            visitor_name: request.visitor_name.clone(),
            mutation: variant.mutation,
        };

        let output = match self.orchestrator.run(utterance, &history, &context, sink).await {
            Ok(output) => output,
            Err(error) => {
                tracing::error!(
                    conversation_id = %conversation.id,
                    session_id = %session_id,
                    error = %error,
                    "turn failed"
                );
                return Err(error);
            }
        };

        let tool_calls = if output.tool_calls.is_empty() {
            None
        } else {
            Some(serde_json::to_value(&output.tool_calls)?)
        };
        let tool_results = if output.tool_results.is_empty() {
            None
        } else {
            Some(serde_json::to_value(&output.tool_results)?)
        };
        self.db.insert_message(
            &conversation.id,
            MessageRole::Agent,
            &output.reply,
            tool_calls.as_ref(),
            tool_results.as_ref(),
        )?;

        let outcome = match self.tracker.refresh(&conversation.id) {
            Ok(label) => label,
            Err(error) => {
                tracing::warn!(conversation_id = %conversation.id, error = %error, "outcome refresh failed");
                None
            }
        };

        Ok(TurnSummary {
            session_id,
            conversation_id: conversation.id,
            reply: output.reply,
            tool_results: output.tool_results,
            outcome,
        })
    }

    /// Newest conversation of the session and its messages, creating an empty one if needed.
    pub fn history(&self, session_id: &str) -> AppResult<ConversationHistory> {
        let conversation = self.open_conversation(session_id, None)?;
        let messages = self.db.list_messages(&conversation.id)?;
        Ok(ConversationHistory {
            session_id: session_id.to_string(),
            conversation_id: conversation.id,
            messages,
        })
    }

    /// Starts over under a fresh session id; earlier conversations stay stored.
    pub async fn clear(&self, session_id: &str) -> AppResult<ConversationHistory> {
        if session_id.trim().is_empty() {
            return Err(AppError::InvalidInput("session id is required".to_string()));
        }
        self.locks.forget(session_id).await;
        let fresh = new_session_id();
        let conversation = self.open_conversation(&fresh, None)?;
        tracing::info!(previous_session = %session_id, session_id = %fresh, "conversation cleared");
        Ok(ConversationHistory {
            session_id: fresh,
            conversation_id: conversation.id,
            messages: Vec::new(),
        })
    }

    fn open_conversation(&self, session_id: &str, current_page: Option<&str>) -> AppResult<Conversation> {
        let current_page = current_page.map(str::trim).filter(|page| !page.is_empty());

        if let Some(mut conversation) = self.db.find_latest_conversation(session_id)? {
            if let Some(page) = current_page {
                self.db.update_conversation_page(&conversation.id, page)?;
                conversation.current_page = Some(page.to_string());
            }
            return Ok(conversation);
        }

        let assignment = self.experiments.assign_for_session(session_id)?;
        let variant_id = assignment.as_ref().map(|assignment| assignment.variant.id.as_str());
        let conversation = self.db.insert_conversation(session_id, current_page, variant_id)?;
        tracing::info!(
            conversation_id = %conversation.id,
            session_id = %session_id,
            variant = assignment.as_ref().map(|a| a.variant.name.as_str()).unwrap_or("-"),
            "conversation started"
        );
        Ok(conversation)
    }

    fn variant_context(&self, conversation: &Conversation) -> AppResult<VariantContext> {
        let variant = match conversation.variant_id.as_deref() {
            Some(variant_id) => self.experiments.variant(variant_id)?,
            None => None,
        };
        Ok(match variant {
            Some(variant) => VariantContext {
                experiment_id: Some(variant.experiment_id),
                variant_name: Some(variant.name),
                mutation: Some(variant.mutation).filter(|mutation| !mutation.is_noop()),
            },
            None => VariantContext {
                experiment_id: None,
                variant_name: None,
                mutation: None,
            },
        })
    }
}
