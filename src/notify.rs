//! Outbound lead notifications. Delivery is fire-and-forget from the caller's side.

use crate::config::NotificationConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{Lead, LeadQuality};
use crate::scoring::ScoreBreakdown;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadNotification {
    pub name: Option<String>,
    pub email: Option<String>,
    pub company: Option<String>,
    pub role: Option<String>,
    pub company_size: Option<String>,
    pub industry: Option<String>,
    pub lead_score: u32,
    pub lead_quality: LeadQuality,
    pub primary_interest: Option<String>,
    pub pain_points: Vec<String>,
    pub hesitations: Vec<String>,
    pub decision_criteria: Vec<String>,
    pub timeline: Option<String>,
    pub conversation_id: String,
}

impl LeadNotification {
    pub fn from_lead(lead: &Lead, score: &ScoreBreakdown, conversation_id: &str) -> Self {
        Self {
            name: lead.display_name(),
            email: lead.email.clone(),
            company: lead.company.clone(),
            role: lead.role.clone(),
            company_size: lead.company_size.clone(),
            industry: lead.industry.clone(),
            lead_score: score.total_score,
            lead_quality: score.quality,
            primary_interest: lead.primary_interest.clone(),
            pain_points: lead.pain_points.clone(),
            hesitations: lead.hesitations.clone(),
            decision_criteria: lead.decision_criteria.clone(),
            timeline: lead.timeline.clone(),
            conversation_id: conversation_id.to_string(),
        }
    }

    pub fn interest_name(&self) -> &str {
        match self.primary_interest.as_deref() {
            Some("ai-assessment") => "AI Workforce Assessment",
            Some("outsourced-ld") => "Outsourced L&D",
            Some("talent-consulting") => "Talent Consulting",
            Some("training-solutions") => "Training Solutions",
            Some(other) if !other.trim().is_empty() => other,
            _ => "Not specified",
        }
    }

    pub fn subject(&self) -> String {
        let who = self
            .name
            .as_deref()
            .or(self.company.as_deref())
            .unwrap_or("New Visitor");
        format!(
            "{} Lead: {} - {}",
            self.lead_quality.as_str().to_uppercase(),
            who,
            self.interest_name()
        )
    }

    pub fn html(&self) -> String {
        let mut body = format!(
            "<h2>New Lead from Clara</h2>\n<p><strong>{}</strong> ({})<br>{}/100 {}</p>\n<ul>\n",
            escape(self.name.as_deref().unwrap_or("Unknown Name")),
            escape(self.company.as_deref().unwrap_or("Unknown Company")),
            self.lead_score,
            self.lead_quality.as_str().to_uppercase()
        );
        let rows = [
            ("Email", self.email.as_deref()),
            ("Role", self.role.as_deref()),
            ("Company Size", self.company_size.as_deref()),
            ("Industry", self.industry.as_deref()),
            ("Primary Interest", Some(self.interest_name())),
            ("Timeline", self.timeline.as_deref()),
        ];
        for (label, value) in rows {
            if let Some(value) = value {
                body.push_str(&format!("<li>{}: {}</li>\n", label, escape(value)));
            }
        }
        body.push_str("</ul>\n");
        for (title, items) in [
            ("Pain Points Mentioned", &self.pain_points),
            ("Hesitations/Concerns", &self.hesitations),
            ("Decision Criteria", &self.decision_criteria),
        ] {
            if items.is_empty() {
                continue;
            }
            body.push_str(&format!("<h3>{}</h3>\n<ul>\n", title));
            for item in items {
                body.push_str(&format!("<li>{}</li>\n", escape(item)));
            }
            body.push_str("</ul>\n");
        }
        body.push_str(&format!("<p>Conversation ID: {}</p>\n", escape(&self.conversation_id)));
        body
    }
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_lead(&self, notification: &LeadNotification) -> AppResult<()>;
}

/// Used when notifications are disabled or not configured.
#[derive(Debug, Default)]
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn notify_lead(&self, notification: &LeadNotification) -> AppResult<()> {
        tracing::debug!(
            conversation_id = %notification.conversation_id,
            quality = notification.lead_quality.as_str(),
            "lead notification skipped: notifications disabled"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ResendNotifier {
    http: reqwest::Client,
    api_key: String,
    from: String,
    to: String,
}

impl ResendNotifier {
    pub fn new(api_key: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> AppResult<Self> {
        let http = reqwest::Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            from: from.into(),
            to: to.into(),
        })
    }
}

#[async_trait]
impl Notifier for ResendNotifier {
    async fn notify_lead(&self, notification: &LeadNotification) -> AppResult<()> {
        let response = self
            .http
            .post(RESEND_ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "from": self.from,
                "to": [self.to],
                "subject": notification.subject(),
                "html": notification.html(),
            }))
            .send()
            .await
            .map_err(|err| AppError::Notification(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Notification(format!("email provider returned {}: {}", status, body)));
        }
        tracing::info!(
            conversation_id = %notification.conversation_id,
            quality = notification.lead_quality.as_str(),
            "lead notification sent"
        );
        Ok(())
    }
}

pub fn notifier_from_config(config: &NotificationConfig) -> AppResult<Arc<dyn Notifier>> {
    match (config.is_deliverable(), &config.api_key, &config.recipient) {
        (true, Some(api_key), Some(recipient)) => Ok(Arc::new(ResendNotifier::new(
            api_key.clone(),
            config.sender.clone(),
            recipient.clone(),
        )?)),
        _ => Ok(Arc::new(DisabledNotifier)),
    }
}

/// Sends in the background; failures are logged and never reach the caller.
pub fn dispatch(notifier: Arc<dyn Notifier>, notification: LeadNotification) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(error) = notifier.notify_lead(&notification).await {
            tracing::warn!(
                conversation_id = %notification.conversation_id,
                error = %error,
                "lead notification failed"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification() -> LeadNotification {
        LeadNotification {
            name: None,
            email: Some("dana@meijer.com".to_string()),
            company: Some("Meijer".to_string()),
            role: Some("VP People".to_string()),
            company_size: Some("1,200".to_string()),
            industry: None,
            lead_score: 75,
            lead_quality: LeadQuality::Hot,
            primary_interest: Some("outsourced-ld".to_string()),
            pain_points: vec!["turnover <40%>".to_string()],
            hesitations: Vec::new(),
            decision_criteria: Vec::new(),
            timeline: None,
            conversation_id: "conv-1".to_string(),
        }
    }

    #[test]
    fn subject_falls_back_to_company_and_names_interest() {
        assert_eq!(notification().subject(), "HOT Lead: Meijer - Outsourced L&D");

        let mut anonymous = notification();
        anonymous.company = None;
        anonymous.primary_interest = None;
        anonymous.lead_quality = LeadQuality::Warm;
        assert_eq!(anonymous.subject(), "WARM Lead: New Visitor - Not specified");
    }

    #[test]
    fn html_escapes_visitor_text_and_skips_empty_sections() {
        let html = notification().html();
        assert!(html.contains("turnover &lt;40%&gt;"));
        assert!(html.contains("Pain Points Mentioned"));
        assert!(!html.contains("Decision Criteria"));
        assert!(html.contains("conv-1"));
    }

    struct Failing;

    #[async_trait]
    impl Notifier for Failing {
        async fn notify_lead(&self, _notification: &LeadNotification) -> AppResult<()> {
            Err(AppError::Notification("smtp down".to_string()))
        }
    }

    #[tokio::test]
    async fn dispatch_swallows_failures() {
        dispatch(Arc::new(Failing), notification()).await.expect("task completes");
    }

    #[test]
    fn undeliverable_config_yields_disabled_notifier() {
        let config = NotificationConfig::default();
        assert!(notifier_from_config(&config).is_ok());
    }
}
