use super::{parse_input, ToolHandler};
use crate::completion::ToolSpec;
use crate::models::{ToolContext, ToolResult};
use crate::scoring::{
    recommended_action, ScoreBreakdown, ScoringInput, ScoringProfile, AUTHORITY_MAX, COMPANY_FIT_MAX, INTENT_MAX,
    TOTAL_MAX,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualificationInput {
    pub company_size: Option<String>,
    pub role_level: Option<String>,
    pub has_pain_point: Option<bool>,
    pub timeline: Option<String>,
    pub industry: Option<String>,
}

impl QualificationInput {
    pub fn score(&self) -> ScoreBreakdown {
        ScoringProfile::ADHOC.score(&ScoringInput {
            company_size: self.company_size.as_deref(),
            industry: self.industry.as_deref(),
            role: None,
            role_level: self.role_level.as_deref(),
            has_pain_point: self.has_pain_point.unwrap_or(false),
            timeline: self.timeline.as_deref(),
        })
    }
}

fn or_unknown(value: &Option<String>) -> &str {
    value.as_deref().filter(|value| !value.is_empty()).unwrap_or("unknown")
}

/// Stateless scoring for the agent's own judgment; nothing is persisted.
#[derive(Debug, Default)]
pub struct GetQualificationTool;

#[async_trait]
impl ToolHandler for GetQualificationTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "get_qualification".to_string(),
            description: "Calculate the current lead qualification score based on gathered information. Use this to determine appropriate next steps.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "companySize": { "type": "string", "description": "Company size" },
                    "roleLevel": { "type": "string", "description": "Role level" },
                    "hasPainPoint": { "type": "boolean", "description": "Whether they have articulated a specific pain point" },
                    "timeline": { "type": "string", "description": "Their timeline" },
                    "industry": { "type": "string", "description": "Their industry" }
                },
                "required": []
            }),
        }
    }

    async fn call(&self, input: Value, _context: &ToolContext) -> ToolResult {
        let input: QualificationInput = match parse_input("get_qualification", input) {
            Ok(input) => input,
            Err(failure) => return failure,
        };
        let score = input.score();
        let action = recommended_action(score.quality);

        let data = json!({
            "scores": {
                "companyFit": { "score": score.company_fit_score, "max": COMPANY_FIT_MAX },
                "authority": { "score": score.authority_score, "max": AUTHORITY_MAX },
                "intent": { "score": score.intent_score, "max": INTENT_MAX },
                "total": { "score": score.total_score, "max": TOTAL_MAX },
            },
            "quality": score.quality,
            "recommendedAction": action,
            "breakdown": {
                "companySize": or_unknown(&input.company_size),
                "roleLevel": or_unknown(&input.role_level),
                "hasPainPoint": input.has_pain_point.unwrap_or(false),
                "timeline": or_unknown(&input.timeline),
                "industry": or_unknown(&input.industry),
            },
        });
        let message = format!(
            "Lead qualification: {}/{} ({}). {}",
            score.total_score,
            TOTAL_MAX,
            score.quality.as_str(),
            action
        );
        ToolResult::ok(data, message, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn oversize_company_and_contributor_earn_adhoc_points() {
        let result = GetQualificationTool
            .call(
                json!({"companySize": "4,000 employees", "roleLevel": "Senior Analyst"}),
                &ToolContext::default(),
            )
            .await;
        assert!(result.success);
        assert!(!result.display_to_user);
        let data = result.data.expect("data");
        assert_eq!(data["scores"]["companyFit"]["score"], 15);
        assert_eq!(data["scores"]["authority"]["score"], 5);
        assert_eq!(data["quality"], "cold");
        assert_eq!(data["breakdown"]["timeline"], "unknown");
    }

    #[tokio::test]
    async fn hot_lead_message_recommends_briefing() {
        let result = GetQualificationTool
            .call(
                json!({
                    "companySize": "1,200 employees",
                    "roleLevel": "VP of Operations",
                    "hasPainPoint": true,
                    "timeline": "this quarter"
                }),
                &ToolContext::default(),
            )
            .await;
        assert_eq!(
            result.message,
            "Lead qualification: 90/100 (hot). Present executive briefing option - this is a highly qualified lead"
        );
    }

    #[tokio::test]
    async fn empty_input_is_unknown() {
        let result = GetQualificationTool.call(json!({}), &ToolContext::default()).await;
        let data = result.data.expect("data");
        assert_eq!(data["scores"]["total"]["score"], 0);
        assert_eq!(data["quality"], "unknown");
    }
}
