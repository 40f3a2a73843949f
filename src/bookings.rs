//! Scheduling-confirmation events mapped back to conversations.

use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{Booking, BookingStatus};
use crate::outcomes::OutcomeTracker;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

pub const INVITEE_CREATED: &str = "invitee.created";
pub const INVITEE_CANCELED: &str = "invitee.canceled";

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Default, Deserialize)]
struct InviteePayload {
    email: Option<String>,
    event_type: Option<EventType>,
    scheduled_event: Option<ScheduledEvent>,
    tracking: Option<Tracking>,
}

#[derive(Debug, Default, Deserialize)]
struct EventType {
    slug: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScheduledEvent {
    uuid: String,
    start_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
struct Tracking {
    utm_source: Option<String>,
    utm_content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingEffect {
    Created {
        external_event_id: String,
        conversation_id: Option<String>,
        outcome_updated: bool,
    },
    Canceled {
        external_event_id: String,
        bookings_updated: usize,
    },
    Ignored {
        event: String,
    },
}

pub struct BookingService {
    db: Arc<Database>,
    tracker: OutcomeTracker,
    utm_source: String,
}

impl BookingService {
    pub fn new(db: Arc<Database>, tracker: OutcomeTracker, utm_source: impl Into<String>) -> Self {
        Self {
            db,
            tracker,
            utm_source: utm_source.into(),
        }
    }

    pub fn handle(&self, body: &Value) -> AppResult<BookingEffect> {
        self.handle_at(body, Utc::now())
    }

    /// Applies one webhook body `{event, payload}`. Unrecognized events are acknowledged and ignored.
    pub fn handle_at(&self, body: &Value, now: DateTime<Utc>) -> AppResult<BookingEffect> {
        let envelope: Envelope = serde_json::from_value(body.clone())
            .map_err(|err| AppError::InvalidInput(format!("malformed booking event: {}", err)))?;
        tracing::info!(event = %envelope.event, "booking event received");

        match envelope.event.as_str() {
            INVITEE_CREATED => self.invitee_created(parse_payload(envelope.payload)?, now),
            INVITEE_CANCELED => self.invitee_canceled(parse_payload(envelope.payload)?),
            _ => Ok(BookingEffect::Ignored { event: envelope.event }),
        }
    }

    fn invitee_created(&self, payload: InviteePayload, now: DateTime<Utc>) -> AppResult<BookingEffect> {
        let scheduled = scheduled_event(&payload)?;
        let conversation_id = self.resolve_conversation(&payload)?;

        let booking = Booking {
            id: Uuid::new_v4().to_string(),
            external_event_id: scheduled.uuid.clone(),
            conversation_id: conversation_id.clone(),
            email: payload.email.clone(),
            event_type: payload
                .event_type
                .as_ref()
                .and_then(|kind| kind.slug.clone())
                .unwrap_or_else(|| "unknown".to_string()),
            scheduled_at: scheduled.start_time,
            status: BookingStatus::Scheduled,
            created_at: now,
        };
        if !self.db.insert_booking(&booking)? {
            tracing::debug!(external_event_id = %booking.external_event_id, "booking already recorded");
        }

        let outcome_updated = match conversation_id.as_deref() {
            Some(id) => self.tracker.confirm_scheduled(id, now)?,
            None => false,
        };
        tracing::info!(
            external_event_id = %booking.external_event_id,
            conversation_id = conversation_id.as_deref().unwrap_or("-"),
            event_type = %booking.event_type,
            outcome_updated,
            "booking created"
        );
        Ok(BookingEffect::Created {
            external_event_id: booking.external_event_id,
            conversation_id,
            outcome_updated,
        })
    }

    fn invitee_canceled(&self, payload: InviteePayload) -> AppResult<BookingEffect> {
        let scheduled = scheduled_event(&payload)?;
        let bookings_updated = self.db.cancel_booking(&scheduled.uuid)?;
        tracing::info!(external_event_id = %scheduled.uuid, bookings_updated, "booking canceled");
        Ok(BookingEffect::Canceled {
            external_event_id: scheduled.uuid.clone(),
            bookings_updated,
        })
    }

    /// Attribution tags win; otherwise the newest lead with the invitee's email names its conversation.
    fn resolve_conversation(&self, payload: &InviteePayload) -> AppResult<Option<String>> {
        if let Some(tracking) = &payload.tracking {
            if tracking.utm_source.as_deref() == Some(self.utm_source.as_str()) {
                if let Some(content) = tracking.utm_content.as_deref().filter(|value| !value.is_empty()) {
                    return Ok(Some(content.to_string()));
                }
            }
        }
        let Some(email) = payload.email.as_deref().filter(|value| !value.is_empty()) else {
            return Ok(None);
        };
        Ok(self
            .db
            .find_latest_lead_by_email(email)?
            .and_then(|lead| lead.source))
    }
}

fn parse_payload(payload: Value) -> AppResult<InviteePayload> {
    serde_json::from_value(payload).map_err(|err| AppError::InvalidInput(format!("malformed booking payload: {}", err)))
}

fn scheduled_event(payload: &InviteePayload) -> AppResult<&ScheduledEvent> {
    payload
        .scheduled_event
        .as_ref()
        .ok_or_else(|| AppError::InvalidInput("booking payload has no scheduled_event".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LeadCapture;
    use crate::models::{LeadFields, MessageRole, OutcomeLabel};
    use serde_json::json;

    fn service() -> (tempfile::TempDir, Arc<Database>, BookingService) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("clara.db")).expect("db"));
        let tracker = OutcomeTracker::new(db.clone(), 30);
        let service = BookingService::new(db.clone(), tracker, "clara");
        (dir, db, service)
    }

    fn created(tracking: Value, email: &str) -> Value {
        json!({
            "event": "invitee.created",
            "payload": {
                "email": email,
                "event_type": { "slug": "executive-briefing" },
                "scheduled_event": { "uuid": "evt-1", "start_time": "2026-11-02T15:00:00Z" },
                "tracking": tracking
            }
        })
    }

    #[test]
    fn attributed_booking_schedules_the_conversation() {
        let (_dir, db, service) = service();
        let conversation = db.insert_conversation("s1", None, None).expect("conversation");
        db.insert_message(&conversation.id, MessageRole::Visitor, "hello", None, None)
            .expect("message");

        let effect = service
            .handle(&created(json!({"utm_source": "clara", "utm_content": conversation.id}), "a@b.com"))
            .expect("handled");
        assert_eq!(
            effect,
            BookingEffect::Created {
                external_event_id: "evt-1".to_string(),
                conversation_id: Some(conversation.id.clone()),
                outcome_updated: true,
            }
        );
        let outcome = db.get_outcome(&conversation.id).expect("get").expect("outcome");
        assert_eq!(outcome.label, OutcomeLabel::Scheduled);
        let booking = db.get_booking("evt-1").expect("get").expect("booking");
        assert_eq!(booking.event_type, "executive-briefing");
        assert_eq!(booking.status, BookingStatus::Scheduled);
    }

    #[test]
    fn unattributed_booking_falls_back_to_lead_email() {
        let (_dir, db, service) = service();
        let conversation = db.insert_conversation("s1", None, None).expect("conversation");
        let fields = LeadFields {
            email: Some("dana@meijer.com".to_string()),
            ..LeadFields::default()
        };
        db.save_lead_capture(&LeadCapture {
            lead_id: None,
            fields: &fields,
            pain_points: &[],
            hesitations: &[],
            decision_criteria: &[],
            source: &conversation.id,
        })
        .expect("lead");

        let effect = service
            .handle(&created(json!({"utm_source": "newsletter", "utm_content": "other"}), "dana@meijer.com"))
            .expect("handled");
        match effect {
            BookingEffect::Created { conversation_id, .. } => {
                assert_eq!(conversation_id.as_deref(), Some(conversation.id.as_str()))
            }
            other => panic!("unexpected effect: {:?}", other),
        }
    }

    #[test]
    fn cancellation_keeps_scheduled_outcome() {
        let (_dir, db, service) = service();
        let conversation = db.insert_conversation("s1", None, None).expect("conversation");
        service
            .handle(&created(json!({"utm_source": "clara", "utm_content": conversation.id}), "a@b.com"))
            .expect("created");

        let effect = service
            .handle(&json!({"event": "invitee.canceled", "payload": {"scheduled_event": {"uuid": "evt-1"}}}))
            .expect("canceled");
        assert_eq!(
            effect,
            BookingEffect::Canceled {
                external_event_id: "evt-1".to_string(),
                bookings_updated: 1,
            }
        );
        assert_eq!(db.get_booking("evt-1").expect("get").expect("booking").status, BookingStatus::Canceled);
        assert_eq!(
            db.get_outcome(&conversation.id).expect("get").expect("outcome").label,
            OutcomeLabel::Scheduled
        );
    }

    #[test]
    fn malformed_and_unknown_events() {
        let (_dir, _db, service) = service();
        assert!(matches!(service.handle(&json!({"payload": {}})), Err(AppError::InvalidInput(_))));
        assert!(matches!(
            service.handle(&json!({"event": "invitee.created", "payload": {"email": "a@b.com"}})),
            Err(AppError::InvalidInput(_))
        ));
        assert_eq!(
            service.handle(&json!({"event": "routing_form_submission.created"})).expect("ignored"),
            BookingEffect::Ignored {
                event: "routing_form_submission.created".to_string()
            }
        );
    }
}
