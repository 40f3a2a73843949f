use crate::db::Database;
use crate::errors::AppResult;
use crate::models::{Conversation, Lead, Message, Outcome, OutcomeLabel};
use crate::scoring::{ScoringInput, ScoringProfile};
use crate::signals::{analyze_messages, IntentSignals};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const QUALIFIED_MIN_SCORE: u32 = 70;
pub const QUALIFIED_MIN_MESSAGES: u32 = 6;
pub const ENGAGED_MIN_MESSAGES: u32 = 3;
pub const IDLE_BOUNCE_MINUTES: i64 = 30;
const NO_ACTIVITY_MINUTES: i64 = 999;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeSignals {
    pub message_count: u32,
    pub lead_score: Option<u32>,
    pub intent: IntentSignals,
    pub scheduling_confirmed: bool,
    pub minutes_since_activity: i64,
}

/// Priority-ordered classification; the first rule that fires wins.
pub fn classify(signals: &OutcomeSignals) -> OutcomeLabel {
    if signals.scheduling_confirmed {
        return OutcomeLabel::Scheduled;
    }
    if signals.lead_score.is_some_and(|score| score >= QUALIFIED_MIN_SCORE)
        && signals.message_count >= QUALIFIED_MIN_MESSAGES
    {
        return OutcomeLabel::Qualified;
    }
    if signals.intent.shows_buying_intent() {
        return OutcomeLabel::Interested;
    }
    if signals.message_count < ENGAGED_MIN_MESSAGES || signals.minutes_since_activity > IDLE_BOUNCE_MINUTES {
        return OutcomeLabel::Bounced;
    }
    OutcomeLabel::Interested
}

/// Re-evaluates and persists conversation outcomes.
#[derive(Clone)]
pub struct OutcomeTracker {
    db: Arc<Database>,
    stale_after: Duration,
}

impl OutcomeTracker {
    pub fn new(db: Arc<Database>, stale_after_minutes: i64) -> Self {
        Self {
            db,
            stale_after: Duration::minutes(stale_after_minutes),
        }
    }

    pub fn refresh(&self, conversation_id: &str) -> AppResult<Option<OutcomeLabel>> {
        self.refresh_at(conversation_id, Utc::now())
    }

    /// Classifies a conversation as of `now` and upserts its outcome.
    ///
    /// Returns `None` when the conversation does not exist. A stored `SCHEDULED` outcome is
    /// returned without re-evaluation.
    pub fn refresh_at(&self, conversation_id: &str, now: DateTime<Utc>) -> AppResult<Option<OutcomeLabel>> {
        let Some(conversation) = self.db.get_conversation(conversation_id)? else {
            tracing::debug!(conversation_id = %conversation_id, "outcome refresh skipped: conversation not found");
            return Ok(None);
        };

        let existing = self.db.get_outcome(conversation_id)?;
        if existing.as_ref().map(|outcome| outcome.label) == Some(OutcomeLabel::Scheduled) {
            return Ok(Some(OutcomeLabel::Scheduled));
        }

        let messages = self.db.list_messages(conversation_id)?;
        let lead = self.linked_lead(&conversation)?;
        let lead_score = lead
            .as_ref()
            .map(|lead| ScoringProfile::PERSISTED.score(&ScoringInput::from_lead(lead)).total_score);
        let minutes_since_activity = messages
            .last()
            .map(|message| (now - message.created_at).num_minutes())
            .unwrap_or(NO_ACTIVITY_MINUTES);

        let signals = OutcomeSignals {
            message_count: messages.len() as u32,
            lead_score,
            intent: analyze_messages(&messages),
            scheduling_confirmed: false,
            minutes_since_activity,
        };
        let label = classify(&signals);

        let outcome = snapshot(&conversation, lead.as_ref(), &messages, label, now);
        self.db.upsert_outcome(&outcome)?;
        tracing::info!(
            conversation_id = %conversation_id,
            outcome = label.as_str(),
            message_count = outcome.message_count,
            "conversation outcome updated"
        );
        Ok(Some(label))
    }

    /// Forces `SCHEDULED` after an external booking confirmation.
    ///
    /// Returns false when the conversation does not exist.
    pub fn confirm_scheduled(&self, conversation_id: &str, now: DateTime<Utc>) -> AppResult<bool> {
        let Some(conversation) = self.db.get_conversation(conversation_id)? else {
            return Ok(false);
        };
        let messages = self.db.list_messages(conversation_id)?;
        let lead = self.linked_lead(&conversation)?;
        let outcome = snapshot(&conversation, lead.as_ref(), &messages, OutcomeLabel::Scheduled, now);
        self.db.upsert_outcome(&outcome)?;
        tracing::info!(conversation_id = %conversation_id, "conversation outcome updated to SCHEDULED");
        Ok(true)
    }

    pub fn sweep_stale(&self) -> AppResult<usize> {
        self.sweep_stale_at(Utc::now())
    }

    /// Re-evaluates every conversation idle past the threshold with an open outcome.
    ///
    /// Per-conversation failures are logged and skipped; returns the number updated.
    pub fn sweep_stale_at(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let cutoff = now - self.stale_after;
        let candidates = self.db.stale_conversation_ids(cutoff)?;
        let mut updated = 0usize;
        for conversation_id in &candidates {
            match self.refresh_at(conversation_id, now) {
                Ok(Some(_)) => updated += 1,
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(conversation_id = %conversation_id, error = %error, "stale outcome refresh failed");
                }
            }
        }
        tracing::info!(candidates = candidates.len(), updated, "stale outcome sweep finished");
        Ok(updated)
    }

    fn linked_lead(&self, conversation: &Conversation) -> AppResult<Option<Lead>> {
        match conversation.lead_id.as_deref() {
            Some(lead_id) => self.db.get_lead(lead_id),
            None => Ok(None),
        }
    }
}

fn snapshot(
    conversation: &Conversation,
    lead: Option<&Lead>,
    messages: &[Message],
    label: OutcomeLabel,
    now: DateTime<Utc>,
) -> Outcome {
    let duration_sec = match (messages.first(), messages.last()) {
        (Some(first), Some(last)) => (last.created_at - first.created_at).num_seconds().max(0),
        _ => 0,
    };
    Outcome {
        conversation_id: conversation.id.clone(),
        variant_id: conversation.variant_id.clone(),
        label,
        classified_at: now,
        message_count: messages.len() as u32,
        duration_sec,
        visitor_role: lead.and_then(|lead| lead.role.clone()),
        company_size: lead.and_then(|lead| lead.company_size.clone()),
        industry: lead.and_then(|lead| lead.industry.clone()),
        primary_interest: lead.and_then(|lead| lead.primary_interest.clone()),
    }
}
