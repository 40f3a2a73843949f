use super::{parse_input, ToolHandler};
use crate::completion::ToolSpec;
use crate::db::{Database, LeadCapture};
use crate::errors::{AppError, AppResult};
use crate::models::{Lead, LeadFields, ToolContext, ToolResult};
use crate::notify::{dispatch, LeadNotification, Notifier};
use crate::scoring::{ScoreBreakdown, ScoringInput, ScoringProfile, TOTAL_MAX};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaptureInput {
    #[serde(flatten)]
    fields: LeadFields,
    #[serde(default)]
    pain_points: Vec<String>,
    #[serde(default)]
    hesitations: Vec<String>,
    #[serde(default)]
    decision_criteria: Vec<String>,
}

impl CaptureInput {
    /// Blank strings carry no information and must not overwrite stored values.
    fn normalized(mut self) -> Self {
        let fields = &mut self.fields;
        for field in [
            &mut fields.email,
            &mut fields.first_name,
            &mut fields.last_name,
            &mut fields.company,
            &mut fields.company_size,
            &mut fields.industry,
            &mut fields.role,
            &mut fields.role_level,
            &mut fields.primary_interest,
            &mut fields.timeline,
        ] {
            *field = field.take().map(|value| value.trim().to_string()).filter(|value| !value.is_empty());
        }
        for list in [&mut self.pain_points, &mut self.hesitations, &mut self.decision_criteria] {
            list.retain(|item| !item.trim().is_empty());
            for item in list.iter_mut() {
                *item = item.trim().to_string();
            }
        }
        self
    }
}

pub struct CaptureLeadTool {
    db: Arc<Database>,
    notifier: Arc<dyn Notifier>,
}

impl CaptureLeadTool {
    pub fn new(db: Arc<Database>, notifier: Arc<dyn Notifier>) -> Self {
        Self { db, notifier }
    }

    fn capture(&self, input: &CaptureInput, context: &ToolContext) -> AppResult<(Lead, ScoreBreakdown)> {
        let conversation = self
            .db
            .get_conversation(&context.conversation_id)?
            .ok_or_else(|| AppError::NotFound(format!("conversation {}", context.conversation_id)))?;
        // The stored link wins: an earlier capture this turn may have folded the context's lead away.
        let linked = conversation.lead_id.or_else(|| context.lead_id.clone());

        let lead = self.db.save_lead_capture(&LeadCapture {
            lead_id: linked.as_deref(),
            fields: &input.fields,
            pain_points: &input.pain_points,
            hesitations: &input.hesitations,
            decision_criteria: &input.decision_criteria,
            source: &conversation.id,
        })?;

        let score = ScoringProfile::PERSISTED.score(&ScoringInput::from_lead(&lead));
        self.db.update_lead_scores(&lead.id, &score)?;
        self.db.link_conversation_lead(&conversation.id, &lead.id, &score)?;
        Ok((lead, score))
    }
}

#[async_trait]
impl ToolHandler for CaptureLeadTool {
    fn spec(&self) -> ToolSpec {
        let text = |description: &str| json!({ "type": "string", "description": description });
        let list = |description: &str| json!({ "type": "array", "items": { "type": "string" }, "description": description });
        ToolSpec {
            name: "capture_lead".to_string(),
            description: "Save visitor information progressively. Call this whenever you learn new information about the visitor (name, email, company, role, interests, pain points). All fields are optional - capture whatever you know.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "email": text("Visitor email address"),
                    "firstName": text("Visitor first name"),
                    "lastName": text("Visitor last name"),
                    "company": text("Company name"),
                    "companySize": text("Company size (e.g., \"500-1000\", \"1000-2500\")"),
                    "industry": text("Industry"),
                    "role": text("Job title or role"),
                    "roleLevel": text("Level: C-Suite, Director, Manager, Individual Contributor"),
                    "primaryInterest": text("Primary service interest: ai-assessment, outsourced-ld, talent-consulting, training-solutions"),
                    "painPoints": list("Specific challenges mentioned"),
                    "hesitations": list("Concerns or objections expressed"),
                    "decisionCriteria": list("What will drive their decision"),
                    "timeline": text("When they want to act")
                },
                "required": []
            }),
        }
    }

    async fn call(&self, input: Value, context: &ToolContext) -> ToolResult {
        let input: CaptureInput = match parse_input("capture_lead", input) {
            Ok(input) => input,
            Err(failure) => return failure,
        };
        let input = input.normalized();

        let (lead, score) = match self.capture(&input, context) {
            Ok(captured) => captured,
            Err(error) => {
                tracing::error!(conversation_id = %context.conversation_id, error = %error, "lead capture failed");
                return ToolResult::failure("Failed to capture lead information");
            }
        };
        tracing::info!(
            conversation_id = %context.conversation_id,
            lead_id = %lead.id,
            score = score.total_score,
            quality = score.quality.as_str(),
            "lead captured"
        );

        if score.quality.warrants_notification() && lead.email.is_some() {
            dispatch(
                self.notifier.clone(),
                LeadNotification::from_lead(&lead, &score, &context.conversation_id),
            );
        }

        let data = json!({
            "leadId": lead.id,
            "companyFitScore": score.company_fit_score,
            "authorityScore": score.authority_score,
            "intentScore": score.intent_score,
            "totalScore": score.total_score,
            "quality": score.quality,
        });
        let message = format!(
            "Lead information captured. Score: {}/{} ({})",
            score.total_score,
            TOTAL_MAX,
            score.quality.as_str()
        );
        ToolResult::ok(data, message, false)
    }
}
