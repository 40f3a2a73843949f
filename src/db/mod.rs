use crate::errors::{AppError, AppResult};
use crate::models::{
    Booking, BookingStatus, Conversation, Experiment, ExperimentStatus, Lead, LeadFields, LeadListField, LeadQuality,
    Message, MessageRole, NewExperiment, Outcome, OutcomeLabel, PromptMutation, Variant,
};
use crate::scoring::ScoreBreakdown;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

const CONVERSATION_COLUMNS: &str =
    "id, session_id, lead_id, variant_id, current_page, lead_score, lead_quality, started_at, last_activity";
const LEAD_COLUMNS: &str = "id, email, first_name, last_name, company, company_size, industry, role, role_level,
     primary_interest, pain_points_json, hesitations_json, decision_criteria_json, timeline,
     company_fit_score, authority_score, intent_score, total_score, quality, source, created_at, updated_at";
const OUTCOME_COLUMNS: &str = "conversation_id, variant_id, label, classified_at, message_count, duration_sec,
     visitor_role, company_size, industry, primary_interest";
const EXPERIMENT_COLUMNS: &str = "id, name, description, status, target_size, created_at, started_at, ended_at";

/// Everything `capture_lead` learned in one call.
#[derive(Debug, Clone, Copy)]
pub struct LeadCapture<'a> {
    /// Lead already linked to the conversation, if any.
    pub lead_id: Option<&'a str>,
    pub fields: &'a LeadFields,
    pub pain_points: &'a [String],
    pub hesitations: &'a [String],
    pub decision_criteria: &'a [String],
    /// Originating conversation, recorded on newly created leads.
    pub source: &'a str,
}

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
            }
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    pub fn insert_conversation(
        &self,
        session_id: &str,
        current_page: Option<&str>,
        variant_id: Option<&str>,
    ) -> AppResult<Conversation> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO conversations (id, session_id, variant_id, current_page, started_at, last_activity)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![id, session_id, variant_id, current_page, stamp(now)],
        )?;

        Ok(Conversation {
            id,
            session_id: session_id.to_string(),
            lead_id: None,
            variant_id: variant_id.map(ToString::to_string),
            current_page: current_page.map(ToString::to_string),
            lead_score: None,
            lead_quality: None,
            started_at: now,
            last_activity: now,
        })
    }

    pub fn get_conversation(&self, id: &str) -> AppResult<Option<Conversation>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM conversations WHERE id = ?1", CONVERSATION_COLUMNS),
            [id],
            parse_conversation_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    /// Most recently started conversation for a visitor session.
    pub fn find_latest_conversation(&self, session_id: &str) -> AppResult<Option<Conversation>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM conversations WHERE session_id = ?1
                 ORDER BY started_at DESC, rowid DESC LIMIT 1",
                CONVERSATION_COLUMNS
            ),
            [session_id],
            parse_conversation_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn update_conversation_page(&self, id: &str, current_page: &str) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE conversations SET current_page = ?1 WHERE id = ?2",
            params![current_page, id],
        )?;
        Ok(())
    }

    pub fn link_conversation_lead(&self, id: &str, lead_id: &str, score: &ScoreBreakdown) -> AppResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE conversations SET lead_id = ?1, lead_score = ?2, lead_quality = ?3 WHERE id = ?4",
            params![lead_id, score.total_score, score.quality.as_str(), id],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("conversation {}", id)));
        }
        Ok(())
    }

    /// Conversations idle since `cutoff` whose outcome is missing or still open.
    pub fn stale_conversation_ids(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT c.id FROM conversations c
             LEFT JOIN outcomes o ON o.conversation_id = c.id
             WHERE c.last_activity < ?1
               AND (o.label IS NULL OR o.label NOT IN ('SCHEDULED', 'BOUNCED'))
             ORDER BY c.last_activity ASC",
        )?;
        let rows = stmt.query_map([stamp(cutoff)], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    pub fn count_conversations(&self, since: Option<DateTime<Utc>>) -> AppResult<u64> {
        let conn = self.conn()?;
        let count: i64 = match since {
            Some(since) => conn.query_row(
                "SELECT COUNT(1) FROM conversations WHERE started_at >= ?1",
                [stamp(since)],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(1) FROM conversations", [], |row| row.get(0))?,
        };
        Ok(count.max(0) as u64)
    }

    /// Saves a message and touches the conversation's last activity in one transaction.
    pub fn insert_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
        tool_calls: Option<&serde_json::Value>,
        tool_results: Option<&serde_json::Value>,
    ) -> AppResult<Message> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let tool_calls_json = tool_calls.map(serde_json::to_string).transpose()?;
        let tool_results_json = tool_results.map(serde_json::to_string).transpose()?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let touched = tx.execute(
            "UPDATE conversations SET last_activity = ?1 WHERE id = ?2",
            params![stamp(now), conversation_id],
        )?;
        if touched == 0 {
            return Err(AppError::NotFound(format!("conversation {}", conversation_id)));
        }
        tx.execute(
            "INSERT INTO messages (id, conversation_id, role, content, tool_calls_json, tool_results_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                conversation_id,
                role.as_str(),
                content,
                tool_calls_json,
                tool_results_json,
                stamp(now),
            ],
        )?;
        tx.commit()?;

        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            tool_calls: tool_calls.cloned(),
            tool_results: tool_results.cloned(),
            created_at: now,
        })
    }

    pub fn list_messages(&self, conversation_id: &str) -> AppResult<Vec<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, tool_calls_json, tool_results_json, created_at
             FROM messages WHERE conversation_id = ?1
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map([conversation_id], parse_message_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    pub fn get_lead(&self, id: &str) -> AppResult<Option<Lead>> {
        let conn = self.conn()?;
        read_lead(&conn, id)
    }

    pub fn find_latest_lead_by_email(&self, email: &str) -> AppResult<Option<Lead>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM leads WHERE email = ?1 ORDER BY created_at DESC LIMIT 1",
                LEAD_COLUMNS
            ),
            [email],
            parse_lead_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    /// Merges a capture into the linked lead, the lead owning the email, or a new lead.
    ///
    /// Scalar fields overwrite only when provided; list fields are appended distinctly.
    /// An anonymous linked lead whose capture names an email already on file is folded
    /// into that lead and its conversations are relinked.
    pub fn save_lead_capture(&self, capture: &LeadCapture<'_>) -> AppResult<Lead> {
        let now = stamp(Utc::now());
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let linked = match capture.lead_id {
            Some(id) => tx
                .query_row("SELECT id, email FROM leads WHERE id = ?1", [id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
                })
                .optional()?,
            None => None,
        };
        let owner = match capture.fields.email.as_deref() {
            Some(email) => tx
                .query_row(
                    "SELECT id FROM leads WHERE email = ?1 ORDER BY created_at DESC LIMIT 1",
                    [email],
                    |row| row.get::<_, String>(0),
                )
                .optional()?,
            None => None,
        };

        let lead_id = match (linked, owner) {
            (Some((linked_id, _)), None) => linked_id,
            (Some((linked_id, _)), Some(owner_id)) if linked_id == owner_id => linked_id,
            (Some((linked_id, None)), Some(owner_id)) => {
                fold_lead(&tx, &linked_id, &owner_id, &now)?;
                tracing::info!(from = %linked_id, into = %owner_id, "anonymous lead merged into returning visitor");
                owner_id
            }
            (Some((linked_id, Some(_))), Some(owner_id)) => {
                tracing::info!(from = %linked_id, to = %owner_id, "capture email belongs to another lead; switching");
                owner_id
            }
            (None, Some(owner_id)) => owner_id,
            (None, None) => {
                let id = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO leads (id, source, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                    params![id, capture.source, now],
                )?;
                id
            }
        };

        let fields = capture.fields;
        tx.execute(
            "UPDATE leads SET
               email = COALESCE(?2, email),
               first_name = COALESCE(?3, first_name),
               last_name = COALESCE(?4, last_name),
               company = COALESCE(?5, company),
               company_size = COALESCE(?6, company_size),
               industry = COALESCE(?7, industry),
               role = COALESCE(?8, role),
               role_level = COALESCE(?9, role_level),
               primary_interest = COALESCE(?10, primary_interest),
               timeline = COALESCE(?11, timeline),
               updated_at = ?12
             WHERE id = ?1",
            params![
                lead_id,
                fields.email,
                fields.first_name,
                fields.last_name,
                fields.company,
                fields.company_size,
                fields.industry,
                fields.role,
                fields.role_level,
                fields.primary_interest,
                fields.timeline,
                now,
            ],
        )?;

        append_distinct(&tx, &lead_id, LeadListField::PainPoints, capture.pain_points)?;
        append_distinct(&tx, &lead_id, LeadListField::Hesitations, capture.hesitations)?;
        append_distinct(&tx, &lead_id, LeadListField::DecisionCriteria, capture.decision_criteria)?;

        let lead = read_lead(&tx, &lead_id)?
            .ok_or_else(|| AppError::Internal(format!("lead {} vanished during capture", lead_id)))?;
        tx.commit()?;
        Ok(lead)
    }

    /// Appends values not already present; returns the resulting list.
    pub fn append_lead_list(&self, lead_id: &str, field: LeadListField, values: &[String]) -> AppResult<Vec<String>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let merged = append_distinct(&tx, lead_id, field, values)?;
        tx.commit()?;
        Ok(merged)
    }

    pub fn update_lead_scores(&self, lead_id: &str, score: &ScoreBreakdown) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE leads SET company_fit_score = ?1, authority_score = ?2, intent_score = ?3,
               total_score = ?4, quality = ?5, updated_at = ?6
             WHERE id = ?7",
            params![
                score.company_fit_score,
                score.authority_score,
                score.intent_score,
                score.total_score,
                score.quality.as_str(),
                stamp(Utc::now()),
                lead_id,
            ],
        )?;
        Ok(())
    }

    pub fn count_leads(&self) -> AppResult<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(1) FROM leads", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    pub fn insert_experiment(&self, new: &NewExperiment) -> AppResult<Experiment> {
        let now = Utc::now();
        let experiment_id = Uuid::new_v4().to_string();
        let target_size = new.target_size.unwrap_or(100);

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO experiments (id, name, description, status, target_size, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                experiment_id,
                new.name,
                new.description,
                ExperimentStatus::Draft.as_str(),
                target_size,
                stamp(now),
            ],
        )?;

        let mut variants = Vec::with_capacity(new.variants.len());
        for (position, variant) in new.variants.iter().enumerate() {
            let variant_id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO variants (id, experiment_id, name, description, weight, position, mutation_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    variant_id,
                    experiment_id,
                    variant.name,
                    variant.description,
                    variant.weight,
                    position as i64,
                    serde_json::to_string(&variant.mutation)?,
                ],
            )?;
            variants.push(Variant {
                id: variant_id,
                experiment_id: experiment_id.clone(),
                name: variant.name.clone(),
                description: variant.description.clone(),
                weight: variant.weight,
                mutation: variant.mutation.clone(),
            });
        }
        tx.commit()?;

        Ok(Experiment {
            id: experiment_id,
            name: new.name.clone(),
            description: new.description.clone(),
            status: ExperimentStatus::Draft,
            target_size,
            variants,
            created_at: now,
            started_at: None,
            ended_at: None,
        })
    }

    pub fn get_experiment(&self, id: &str) -> AppResult<Option<Experiment>> {
        let conn = self.conn()?;
        let experiment = conn
            .query_row(
                &format!("SELECT {} FROM experiments WHERE id = ?1", EXPERIMENT_COLUMNS),
                [id],
                parse_experiment_row,
            )
            .optional()?;
        match experiment {
            Some(mut experiment) => {
                experiment.variants = load_variants(&conn, &experiment.id)?;
                Ok(Some(experiment))
            }
            None => Ok(None),
        }
    }

    pub fn find_active_experiment(&self) -> AppResult<Option<Experiment>> {
        let conn = self.conn()?;
        let experiment = conn
            .query_row(
                &format!("SELECT {} FROM experiments WHERE status = 'active' LIMIT 1", EXPERIMENT_COLUMNS),
                [],
                parse_experiment_row,
            )
            .optional()?;
        match experiment {
            Some(mut experiment) => {
                experiment.variants = load_variants(&conn, &experiment.id)?;
                Ok(Some(experiment))
            }
            None => Ok(None),
        }
    }

    pub fn list_experiments(&self) -> AppResult<Vec<Experiment>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM experiments ORDER BY created_at DESC, rowid DESC",
            EXPERIMENT_COLUMNS
        ))?;
        let rows = stmt.query_map([], parse_experiment_row)?;
        let mut experiments = rows.collect::<Result<Vec<_>, _>>()?;
        for experiment in &mut experiments {
            experiment.variants = load_variants(&conn, &experiment.id)?;
        }
        Ok(experiments)
    }

    /// Pauses every other active experiment and activates `id` atomically.
    ///
    /// Returns the ids that were paused.
    pub fn activate_experiment(&self, id: &str) -> AppResult<Vec<String>> {
        let now = stamp(Utc::now());
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let paused = {
            let mut stmt = tx.prepare("SELECT id FROM experiments WHERE status = 'active' AND id != ?1")?;
            let rows = stmt.query_map([id], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        tx.execute(
            "UPDATE experiments SET status = 'paused' WHERE status = 'active' AND id != ?1",
            [id],
        )?;
        let changed = tx.execute(
            "UPDATE experiments SET status = 'active', started_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("experiment {}", id)));
        }
        tx.commit()?;
        Ok(paused)
    }

    pub fn update_experiment_status(&self, id: &str, status: ExperimentStatus) -> AppResult<()> {
        let conn = self.conn()?;
        let changed = match status {
            ExperimentStatus::Completed => conn.execute(
                "UPDATE experiments SET status = ?1, ended_at = ?2 WHERE id = ?3",
                params![status.as_str(), stamp(Utc::now()), id],
            )?,
            _ => conn.execute(
                "UPDATE experiments SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )?,
        };
        if changed == 0 {
            return Err(AppError::NotFound(format!("experiment {}", id)));
        }
        Ok(())
    }

    /// Deletes an experiment and its variants unless any outcome references them.
    pub fn delete_experiment(&self, id: &str) -> AppResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let exists = tx
            .query_row("SELECT 1 FROM experiments WHERE id = ?1", [id], |_| Ok(()))
            .optional()?
            .is_some();
        if !exists {
            return Err(AppError::NotFound(format!("experiment {}", id)));
        }

        let outcomes: i64 = tx.query_row(
            "SELECT COUNT(1) FROM outcomes o JOIN variants v ON v.id = o.variant_id WHERE v.experiment_id = ?1",
            [id],
            |row| row.get(0),
        )?;
        if outcomes > 0 {
            return Err(AppError::Conflict(
                "experiment has recorded outcomes; complete it instead".to_string(),
            ));
        }

        tx.execute("DELETE FROM variants WHERE experiment_id = ?1", [id])?;
        tx.execute("DELETE FROM experiments WHERE id = ?1", [id])?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_variant(&self, id: &str) -> AppResult<Option<Variant>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, experiment_id, name, description, weight, mutation_json FROM variants WHERE id = ?1",
            [id],
            parse_variant_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    /// Upserts by conversation id. A stored `SCHEDULED` label is only replaced by another
    /// `SCHEDULED`; returns whether the row was written.
    pub fn upsert_outcome(&self, outcome: &Outcome) -> AppResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "INSERT INTO outcomes (
               conversation_id, variant_id, label, classified_at, message_count, duration_sec,
               visitor_role, company_size, industry, primary_interest
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(conversation_id) DO UPDATE SET
               variant_id = COALESCE(outcomes.variant_id, excluded.variant_id),
               label = excluded.label,
               classified_at = excluded.classified_at,
               message_count = excluded.message_count,
               duration_sec = excluded.duration_sec,
               visitor_role = COALESCE(excluded.visitor_role, outcomes.visitor_role),
               company_size = COALESCE(excluded.company_size, outcomes.company_size),
               industry = COALESCE(excluded.industry, outcomes.industry),
               primary_interest = COALESCE(excluded.primary_interest, outcomes.primary_interest)
             WHERE outcomes.label != 'SCHEDULED' OR excluded.label = 'SCHEDULED'",
            params![
                outcome.conversation_id,
                outcome.variant_id,
                outcome.label.as_str(),
                stamp(outcome.classified_at),
                outcome.message_count,
                outcome.duration_sec,
                outcome.visitor_role,
                outcome.company_size,
                outcome.industry,
                outcome.primary_interest,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_outcome(&self, conversation_id: &str) -> AppResult<Option<Outcome>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM outcomes WHERE conversation_id = ?1", OUTCOME_COLUMNS),
            [conversation_id],
            parse_outcome_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_outcomes_for_variant(&self, variant_id: &str) -> AppResult<Vec<Outcome>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM outcomes WHERE variant_id = ?1 ORDER BY classified_at ASC",
            OUTCOME_COLUMNS
        ))?;
        let rows = stmt.query_map([variant_id], parse_outcome_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    pub fn list_outcomes_since(&self, since: DateTime<Utc>) -> AppResult<Vec<Outcome>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM outcomes WHERE classified_at >= ?1 ORDER BY classified_at DESC",
            OUTCOME_COLUMNS
        ))?;
        let rows = stmt.query_map([stamp(since)], parse_outcome_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    pub fn count_outcomes(&self) -> AppResult<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(1) FROM outcomes", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Records a booking; a redelivered event id is ignored. Returns whether a row was added.
    pub fn insert_booking(&self, booking: &Booking) -> AppResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "INSERT INTO bookings (id, external_event_id, conversation_id, email, event_type, scheduled_at, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(external_event_id) DO NOTHING",
            params![
                booking.id,
                booking.external_event_id,
                booking.conversation_id,
                booking.email,
                booking.event_type,
                booking.scheduled_at.map(stamp),
                booking.status.as_str(),
                stamp(booking.created_at),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn cancel_booking(&self, external_event_id: &str) -> AppResult<usize> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE bookings SET status = ?1 WHERE external_event_id = ?2",
            params![BookingStatus::Canceled.as_str(), external_event_id],
        )?;
        Ok(changed)
    }

    pub fn get_booking(&self, external_event_id: &str) -> AppResult<Option<Booking>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, external_event_id, conversation_id, email, event_type, scheduled_at, status, created_at
             FROM bookings WHERE external_event_id = ?1",
            [external_event_id],
            parse_booking_row,
        )
        .optional()
        .map_err(AppError::from)
    }
}

fn read_lead(conn: &Connection, id: &str) -> AppResult<Option<Lead>> {
    conn.query_row(
        &format!("SELECT {} FROM leads WHERE id = ?1", LEAD_COLUMNS),
        [id],
        parse_lead_row,
    )
    .optional()
    .map_err(AppError::from)
}

fn append_distinct(conn: &Connection, lead_id: &str, field: LeadListField, values: &[String]) -> AppResult<Vec<String>> {
    let column = field.column();
    let raw: Option<String> = conn
        .query_row(&format!("SELECT {} FROM leads WHERE id = ?1", column), [lead_id], |row| {
            row.get(0)
        })
        .optional()?;
    let Some(raw) = raw else {
        return Err(AppError::NotFound(format!("lead {}", lead_id)));
    };

    let mut current = serde_json::from_str::<Vec<String>>(&raw)?;
    let before = current.len();
    for value in values {
        let value = value.trim();
        if !value.is_empty() && !current.iter().any(|existing| existing == value) {
            current.push(value.to_string());
        }
    }
    if current.len() != before {
        conn.execute(
            &format!("UPDATE leads SET {} = ?1 WHERE id = ?2", column),
            params![serde_json::to_string(&current)?, lead_id],
        )?;
    }
    Ok(current)
}

const FOLDED_LEAD_COLUMNS: &[&str] = &[
    "first_name",
    "last_name",
    "company",
    "company_size",
    "industry",
    "role",
    "role_level",
    "primary_interest",
    "timeline",
];

/// Moves everything known about lead `from` onto lead `into`, then removes `from`.
/// Values on `from` are newer and win over those on `into`.
fn fold_lead(conn: &Connection, from: &str, into: &str, now: &str) -> AppResult<()> {
    let source = read_lead(conn, from)?.ok_or_else(|| AppError::NotFound(format!("lead {}", from)))?;
    let assignments = FOLDED_LEAD_COLUMNS
        .iter()
        .map(|column| format!("{column} = COALESCE((SELECT {column} FROM leads WHERE id = ?1), {column})"))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute(
        &format!("UPDATE leads SET {}, updated_at = ?3 WHERE id = ?2", assignments),
        params![from, into, now],
    )?;

    append_distinct(conn, into, LeadListField::PainPoints, &source.pain_points)?;
    append_distinct(conn, into, LeadListField::Hesitations, &source.hesitations)?;
    append_distinct(conn, into, LeadListField::DecisionCriteria, &source.decision_criteria)?;

    conn.execute("UPDATE conversations SET lead_id = ?1 WHERE lead_id = ?2", params![into, from])?;
    conn.execute("DELETE FROM leads WHERE id = ?1", [from])?;
    Ok(())
}

fn load_variants(conn: &Connection, experiment_id: &str) -> AppResult<Vec<Variant>> {
    let mut stmt = conn.prepare(
        "SELECT id, experiment_id, name, description, weight, mutation_json
         FROM variants WHERE experiment_id = ?1 ORDER BY position ASC",
    )?;
    let rows = stmt.query_map([experiment_id], parse_variant_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
}

fn parse_conversation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        session_id: row.get(1)?,
        lead_id: row.get(2)?,
        variant_id: row.get(3)?,
        current_page: row.get(4)?,
        lead_score: row.get(5)?,
        lead_quality: row
            .get::<_, Option<String>>(6)?
            .map(|raw| LeadQuality::parse(&raw)),
        started_at: parse_time(&row.get::<_, String>(7)?)?,
        last_activity: parse_time(&row.get::<_, String>(8)?)?,
    })
}

fn parse_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role_raw: String = row.get(2)?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: MessageRole::parse(&role_raw).ok_or_else(|| invalid_text(format!("Unknown role '{}'", role_raw)))?,
        content: row.get(3)?,
        tool_calls: parse_json_column(row.get(4)?),
        tool_results: parse_json_column(row.get(5)?),
        created_at: parse_time(&row.get::<_, String>(6)?)?,
    })
}

fn parse_lead_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lead> {
    Ok(Lead {
        id: row.get(0)?,
        email: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        company: row.get(4)?,
        company_size: row.get(5)?,
        industry: row.get(6)?,
        role: row.get(7)?,
        role_level: row.get(8)?,
        primary_interest: row.get(9)?,
        pain_points: parse_string_list(&row.get::<_, String>(10)?),
        hesitations: parse_string_list(&row.get::<_, String>(11)?),
        decision_criteria: parse_string_list(&row.get::<_, String>(12)?),
        timeline: row.get(13)?,
        company_fit_score: row.get(14)?,
        authority_score: row.get(15)?,
        intent_score: row.get(16)?,
        total_score: row.get(17)?,
        quality: LeadQuality::parse(&row.get::<_, String>(18)?),
        source: row.get(19)?,
        created_at: parse_time(&row.get::<_, String>(20)?)?,
        updated_at: parse_time(&row.get::<_, String>(21)?)?,
    })
}

fn parse_experiment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Experiment> {
    let status_raw: String = row.get(3)?;
    Ok(Experiment {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        status: ExperimentStatus::parse(&status_raw)
            .ok_or_else(|| invalid_text(format!("Unknown experiment status '{}'", status_raw)))?,
        target_size: row.get(4)?,
        variants: Vec::new(),
        created_at: parse_time(&row.get::<_, String>(5)?)?,
        started_at: row
            .get::<_, Option<String>>(6)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        ended_at: row
            .get::<_, Option<String>>(7)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
    })
}

fn parse_variant_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Variant> {
    let mutation_raw: String = row.get(5)?;
    Ok(Variant {
        id: row.get(0)?,
        experiment_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        weight: row.get(4)?,
        mutation: serde_json::from_str::<PromptMutation>(&mutation_raw).unwrap_or_else(|_| PromptMutation::noop()),
    })
}

fn parse_outcome_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Outcome> {
    let label_raw: String = row.get(2)?;
    Ok(Outcome {
        conversation_id: row.get(0)?,
        variant_id: row.get(1)?,
        label: OutcomeLabel::parse(&label_raw).ok_or_else(|| invalid_text(format!("Unknown outcome '{}'", label_raw)))?,
        classified_at: parse_time(&row.get::<_, String>(3)?)?,
        message_count: row.get(4)?,
        duration_sec: row.get(5)?,
        visitor_role: row.get(6)?,
        company_size: row.get(7)?,
        industry: row.get(8)?,
        primary_interest: row.get(9)?,
    })
}

fn parse_booking_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Booking> {
    let status = match row.get::<_, String>(6)?.as_str() {
        "canceled" => BookingStatus::Canceled,
        _ => BookingStatus::Scheduled,
    };
    Ok(Booking {
        id: row.get(0)?,
        external_event_id: row.get(1)?,
        conversation_id: row.get(2)?,
        email: row.get(3)?,
        event_type: row.get(4)?,
        scheduled_at: row
            .get::<_, Option<String>>(5)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        status,
        created_at: parse_time(&row.get::<_, String>(7)?)?,
    })
}

fn parse_string_list(raw: &str) -> Vec<String> {
    serde_json::from_str::<Vec<String>>(raw).unwrap_or_default()
}

fn parse_json_column(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|raw| serde_json::from_str(&raw).ok())
}

fn invalid_text(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

/// Fixed-width UTC timestamps so text comparison in SQL orders chronologically.
fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| invalid_text(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::{Database, LeadCapture};
    use crate::models::{
        ExperimentStatus, LeadFields, LeadListField, MessageRole, MutationKind, NewExperiment, NewVariant, Outcome,
        OutcomeLabel, PromptMutation,
    };
    use crate::scoring::ScoreBreakdown;
    use chrono::{Duration, Utc};

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("clara.db")).expect("db");
        (dir, db)
    }

    fn two_arm_experiment(name: &str) -> NewExperiment {
        NewExperiment {
            name: name.to_string(),
            description: None,
            target_size: None,
            variants: vec![
                NewVariant {
                    name: "control".to_string(),
                    description: None,
                    weight: 50,
                    mutation: PromptMutation::noop(),
                },
                NewVariant {
                    name: "direct".to_string(),
                    description: None,
                    weight: 50,
                    mutation: PromptMutation {
                        kind: MutationKind::Append,
                        section: Some("RESPONSE STYLE".to_string()),
                        content: "- Be direct".to_string(),
                    },
                },
            ],
        }
    }

    fn outcome(conversation_id: &str, label: OutcomeLabel) -> Outcome {
        Outcome {
            conversation_id: conversation_id.to_string(),
            variant_id: None,
            label,
            classified_at: Utc::now(),
            message_count: 4,
            duration_sec: 60,
            visitor_role: None,
            company_size: None,
            industry: None,
            primary_interest: None,
        }
    }

    #[test]
    fn latest_conversation_for_session_wins() {
        let (_dir, db) = test_db();
        db.insert_conversation("session-1", Some("/"), None).expect("first");
        let second = db.insert_conversation("session-1", Some("/blog"), None).expect("second");
        db.insert_conversation("session-2", None, None).expect("other");

        let found = db.find_latest_conversation("session-1").expect("query").expect("found");
        assert_eq!(found.id, second.id);
        assert_eq!(found.current_page.as_deref(), Some("/blog"));
    }

    #[test]
    fn messages_are_ordered_and_touch_activity() {
        let (_dir, db) = test_db();
        let conversation = db.insert_conversation("s", None, None).expect("conversation");
        db.insert_message(&conversation.id, MessageRole::Visitor, "hello", None, None)
            .expect("visitor");
        let tool_results = serde_json::json!([{ "success": true }]);
        db.insert_message(&conversation.id, MessageRole::Agent, "hi there", None, Some(&tool_results))
            .expect("agent");

        let messages = db.list_messages(&conversation.id).expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::Visitor);
        assert_eq!(messages[1].tool_results.as_ref(), Some(&tool_results));

        let reloaded = db.get_conversation(&conversation.id).expect("get").expect("exists");
        assert!(reloaded.last_activity >= conversation.last_activity);
    }

    #[test]
    fn message_for_missing_conversation_is_not_found() {
        let (_dir, db) = test_db();
        let err = db
            .insert_message("missing", MessageRole::Visitor, "hello", None, None)
            .expect_err("missing conversation");
        assert!(err.to_string().starts_with("NOT_FOUND"));
    }

    #[test]
    fn lead_capture_merges_by_email_and_appends_distinct() {
        let (_dir, db) = test_db();
        let fields = LeadFields {
            email: Some("dana@example.com".to_string()),
            company: Some("Acme".to_string()),
            ..LeadFields::default()
        };
        let first = db
            .save_lead_capture(&LeadCapture {
                lead_id: None,
                fields: &fields,
                pain_points: &["turnover".to_string()],
                hesitations: &[],
                decision_criteria: &[],
                source: "conv-1",
            })
            .expect("first capture");

        let update = LeadFields {
            email: Some("dana@example.com".to_string()),
            role: Some("VP People".to_string()),
            ..LeadFields::default()
        };
        let second = db
            .save_lead_capture(&LeadCapture {
                lead_id: None,
                fields: &update,
                pain_points: &["turnover".to_string(), "onboarding".to_string()],
                hesitations: &[],
                decision_criteria: &[],
                source: "conv-2",
            })
            .expect("second capture");

        assert_eq!(first.id, second.id);
        assert_eq!(second.company.as_deref(), Some("Acme"));
        assert_eq!(second.role.as_deref(), Some("VP People"));
        assert_eq!(second.pain_points, vec!["turnover", "onboarding"]);
        assert_eq!(second.source.as_deref(), Some("conv-1"));
    }

    #[test]
    fn anonymous_capture_creates_lead_and_list_append_is_distinct() {
        let (_dir, db) = test_db();
        let lead = db
            .save_lead_capture(&LeadCapture {
                lead_id: None,
                fields: &LeadFields::default(),
                pain_points: &[],
                hesitations: &["budget".to_string()],
                decision_criteria: &[],
                source: "conv-1",
            })
            .expect("capture");
        assert!(lead.email.is_none());

        let merged = db
            .append_lead_list(&lead.id, LeadListField::Hesitations, &["budget".to_string(), "timing".to_string()])
            .expect("append");
        assert_eq!(merged, vec!["budget", "timing"]);
    }

    #[test]
    fn returning_email_folds_anonymous_lead_into_known_lead() {
        let (_dir, db) = test_db();
        let known = db
            .save_lead_capture(&LeadCapture {
                lead_id: None,
                fields: &LeadFields {
                    email: Some("dana@example.com".to_string()),
                    company: Some("Acme".to_string()),
                    ..LeadFields::default()
                },
                pain_points: &["turnover".to_string()],
                hesitations: &[],
                decision_criteria: &[],
                source: "conv-1",
            })
            .expect("known lead");

        let conversation = db.insert_conversation("s2", None, None).expect("conversation");
        let anonymous = db
            .save_lead_capture(&LeadCapture {
                lead_id: None,
                fields: &LeadFields {
                    role: Some("SVP of Talent".to_string()),
                    ..LeadFields::default()
                },
                pain_points: &["onboarding".to_string()],
                hesitations: &["budget".to_string()],
                decision_criteria: &[],
                source: &conversation.id,
            })
            .expect("anonymous lead");
        db.link_conversation_lead(&conversation.id, &anonymous.id, &ScoreBreakdown::new(0, 20, 20))
            .expect("link");

        let merged = db
            .save_lead_capture(&LeadCapture {
                lead_id: Some(&anonymous.id),
                fields: &LeadFields {
                    email: Some("dana@example.com".to_string()),
                    timeline: Some("this quarter".to_string()),
                    ..LeadFields::default()
                },
                pain_points: &[],
                hesitations: &[],
                decision_criteria: &[],
                source: &conversation.id,
            })
            .expect("merge into known lead");

        assert_eq!(merged.id, known.id);
        assert_eq!(merged.company.as_deref(), Some("Acme"));
        assert_eq!(merged.role.as_deref(), Some("SVP of Talent"));
        assert_eq!(merged.timeline.as_deref(), Some("this quarter"));
        assert_eq!(merged.pain_points, vec!["turnover", "onboarding"]);
        assert_eq!(merged.hesitations, vec!["budget"]);
        assert_eq!(db.count_leads().expect("count"), 1);
        assert!(db.get_lead(&anonymous.id).expect("get").is_none());
        let relinked = db.get_conversation(&conversation.id).expect("get").expect("conversation");
        assert_eq!(relinked.lead_id.as_deref(), Some(known.id.as_str()));
    }

    #[test]
    fn unreadable_stored_list_is_an_error_not_a_reset() {
        let (_dir, db) = test_db();
        let lead = db
            .save_lead_capture(&LeadCapture {
                lead_id: None,
                fields: &LeadFields::default(),
                pain_points: &["turnover".to_string()],
                hesitations: &[],
                decision_criteria: &[],
                source: "conv-1",
            })
            .expect("lead");
        db.conn()
            .expect("conn")
            .execute("UPDATE leads SET pain_points_json = 'not json' WHERE id = ?1", [&lead.id])
            .expect("corrupt");

        assert!(db
            .append_lead_list(&lead.id, LeadListField::PainPoints, &["onboarding".to_string()])
            .is_err());
        let raw: String = db
            .conn()
            .expect("conn")
            .query_row("SELECT pain_points_json FROM leads WHERE id = ?1", [&lead.id], |row| row.get(0))
            .expect("raw");
        assert_eq!(raw, "not json");
    }

    #[test]
    fn lead_scores_and_conversation_link_persist() {
        let (_dir, db) = test_db();
        let conversation = db.insert_conversation("s", None, None).expect("conversation");
        let lead = db
            .save_lead_capture(&LeadCapture {
                lead_id: None,
                fields: &LeadFields::default(),
                pain_points: &[],
                hesitations: &[],
                decision_criteria: &[],
                source: &conversation.id,
            })
            .expect("lead");
        let score = ScoreBreakdown::new(40, 20, 30);
        db.update_lead_scores(&lead.id, &score).expect("scores");
        db.link_conversation_lead(&conversation.id, &lead.id, &score).expect("link");

        let stored = db.get_lead(&lead.id).expect("get").expect("lead");
        assert_eq!(stored.total_score, 90);
        let linked = db.get_conversation(&conversation.id).expect("get").expect("conversation");
        assert_eq!(linked.lead_id.as_deref(), Some(lead.id.as_str()));
        assert_eq!(linked.lead_score, Some(90));
    }

    #[test]
    fn activating_experiment_pauses_the_previous_one() {
        let (_dir, db) = test_db();
        let first = db.insert_experiment(&two_arm_experiment("first")).expect("first");
        let second = db.insert_experiment(&two_arm_experiment("second")).expect("second");

        db.activate_experiment(&first.id).expect("activate first");
        let paused = db.activate_experiment(&second.id).expect("activate second");
        assert_eq!(paused, vec![first.id.clone()]);

        let active = db.find_active_experiment().expect("query").expect("active");
        assert_eq!(active.id, second.id);
        assert_eq!(active.variants.len(), 2);
        assert_eq!(active.variants[0].name, "control");
        assert!(active.started_at.is_some());

        let first = db.get_experiment(&first.id).expect("get").expect("exists");
        assert_eq!(first.status, ExperimentStatus::Paused);
    }

    #[test]
    fn scheduled_outcome_is_sticky() {
        let (_dir, db) = test_db();
        let conversation = db.insert_conversation("s", None, None).expect("conversation");

        assert!(db.upsert_outcome(&outcome(&conversation.id, OutcomeLabel::Interested)).expect("first"));
        assert!(db.upsert_outcome(&outcome(&conversation.id, OutcomeLabel::Scheduled)).expect("scheduled"));
        assert!(!db.upsert_outcome(&outcome(&conversation.id, OutcomeLabel::Bounced)).expect("downgrade"));

        let stored = db.get_outcome(&conversation.id).expect("get").expect("outcome");
        assert_eq!(stored.label, OutcomeLabel::Scheduled);
    }

    #[test]
    fn stale_query_skips_terminal_outcomes() {
        let (_dir, db) = test_db();
        let open = db.insert_conversation("a", None, None).expect("open");
        let bounced = db.insert_conversation("b", None, None).expect("bounced");
        let interested = db.insert_conversation("c", None, None).expect("interested");
        db.upsert_outcome(&outcome(&bounced.id, OutcomeLabel::Bounced)).expect("bounced outcome");
        db.upsert_outcome(&outcome(&interested.id, OutcomeLabel::Interested)).expect("interested outcome");

        let cutoff = Utc::now() + Duration::minutes(1);
        let stale = db.stale_conversation_ids(cutoff).expect("stale");
        assert!(stale.contains(&open.id));
        assert!(stale.contains(&interested.id));
        assert!(!stale.contains(&bounced.id));

        let none = db.stale_conversation_ids(Utc::now() - Duration::minutes(30)).expect("none");
        assert!(none.is_empty());
    }

    #[test]
    fn delete_refuses_experiment_with_outcomes() {
        let (_dir, db) = test_db();
        let experiment = db.insert_experiment(&two_arm_experiment("exp")).expect("experiment");
        let variant_id = experiment.variants[1].id.clone();
        let conversation = db.insert_conversation("s", None, Some(&variant_id)).expect("conversation");
        let mut recorded = outcome(&conversation.id, OutcomeLabel::Qualified);
        recorded.variant_id = Some(variant_id);
        db.upsert_outcome(&recorded).expect("outcome");

        let err = db.delete_experiment(&experiment.id).expect_err("conflict");
        assert!(err.to_string().starts_with("CONFLICT"));

        let empty = db.insert_experiment(&two_arm_experiment("empty")).expect("empty");
        db.delete_experiment(&empty.id).expect("delete");
        assert!(db.get_experiment(&empty.id).expect("get").is_none());
    }
}
