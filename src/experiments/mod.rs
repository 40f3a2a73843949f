pub mod assignment;
pub mod mutation;

use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{
    ActiveExperimentSummary, Experiment, ExperimentStatus, MutationKind, NewExperiment, NewVariant, PromptMutation,
    SystemStatus, Variant,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

pub use assignment::{assign_variant, assign_variant_name, bucket_for};
pub use mutation::apply_mutation;

pub const CONTROL_VARIANT: &str = "control";

/// The variant a session landed in for the active experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantAssignment {
    pub experiment_id: String,
    pub variant: Variant,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentTemplate {
    pub key: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub variant_count: usize,
}

const TEMPLATE_KEYS: [&str; 2] = ["greetingStyle", "specificityTest"];

pub fn template_summaries() -> Vec<ExperimentTemplate> {
    TEMPLATE_KEYS
        .iter()
        .filter_map(|key| template(key).map(|experiment| (*key, experiment)))
        .map(|(key, experiment)| ExperimentTemplate {
            key,
            name: template_name(key),
            description: template_description(key),
            variant_count: experiment.variants.len(),
        })
        .collect()
}

fn template_name(key: &str) -> &'static str {
    match key {
        "greetingStyle" => "Greeting Style Test",
        "specificityTest" => "Specificity Test",
        _ => "",
    }
}

fn template_description(key: &str) -> &'static str {
    match key {
        "greetingStyle" => "Testing warm vs. direct opening style",
        "specificityTest" => "Testing whether more specific details improve conversion",
        _ => "",
    }
}

/// Predefined experiments; `None` for an unknown key.
pub fn template(key: &str) -> Option<NewExperiment> {
    let control = |description: &str| NewVariant {
        name: CONTROL_VARIANT.to_string(),
        description: Some(description.to_string()),
        weight: 50,
        mutation: PromptMutation::noop(),
    };
    let style_append = |content: &str| PromptMutation {
        kind: MutationKind::Append,
        section: Some("RESPONSE STYLE".to_string()),
        content: content.to_string(),
    };

    let variants = match key {
        "greetingStyle" => vec![
            control("Current warm greeting style"),
            NewVariant {
                name: "direct_opener".to_string(),
                description: Some("Start with a direct question about their challenge".to_string()),
                weight: 50,
                mutation: style_append(
                    "\n- On the FIRST message only, skip the greeting and ask directly: \"What challenge brought you to SDI today?\"",
                ),
            },
        ],
        "specificityTest" => vec![
            control("Current level of detail"),
            NewVariant {
                name: "high_specificity".to_string(),
                description: Some("Include more specific numbers and examples".to_string()),
                weight: 50,
                mutation: style_append(
                    "\n- Always include specific numbers: \"$25K\", \"5 weeks\", \"20% efficiency\", not vague terms\n- When mentioning Big 5, say \"Deloitte or McKinsey\" specifically",
                ),
            },
        ],
        _ => return None,
    };

    Some(NewExperiment {
        name: template_name(key).to_string(),
        description: Some(template_description(key).to_string()),
        target_size: Some(100),
        variants,
    })
}

pub fn validate_new_experiment(new: &NewExperiment) -> AppResult<()> {
    if new.name.trim().is_empty() {
        return Err(AppError::InvalidInput("experiment name is required".to_string()));
    }
    if new.variants.len() < 2 {
        return Err(AppError::InvalidInput("an experiment needs at least 2 variants".to_string()));
    }
    let controls = new
        .variants
        .iter()
        .filter(|variant| variant.name == CONTROL_VARIANT)
        .count();
    if controls != 1 {
        return Err(AppError::InvalidInput(
            "exactly one variant must be named 'control'".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for variant in &new.variants {
        if variant.name.trim().is_empty() {
            return Err(AppError::InvalidInput("variant names must not be empty".to_string()));
        }
        if !seen.insert(variant.name.as_str()) {
            return Err(AppError::InvalidInput(format!("duplicate variant '{}'", variant.name)));
        }
    }
    if new.target_size == Some(0) {
        return Err(AppError::InvalidInput("targetSize must be positive".to_string()));
    }
    Ok(())
}

#[derive(Clone)]
pub struct ExperimentService {
    db: Arc<Database>,
}

impl ExperimentService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn create(&self, new: &NewExperiment) -> AppResult<Experiment> {
        validate_new_experiment(new)?;
        let experiment = self.db.insert_experiment(new)?;
        tracing::info!(
            experiment_id = %experiment.id,
            name = %experiment.name,
            variants = experiment.variants.len(),
            "experiment created"
        );
        Ok(experiment)
    }

    pub fn create_from_template(&self, key: &str) -> AppResult<Experiment> {
        let new = template(key).ok_or_else(|| {
            AppError::InvalidInput(format!(
                "unknown template '{}'; available: {}",
                key,
                TEMPLATE_KEYS.join(", ")
            ))
        })?;
        self.create(&new)
    }

    pub fn get(&self, id: &str) -> AppResult<Experiment> {
        self.db
            .get_experiment(id)?
            .ok_or_else(|| AppError::NotFound(format!("experiment {}", id)))
    }

    pub fn list(&self) -> AppResult<Vec<Experiment>> {
        self.db.list_experiments()
    }

    pub fn active(&self) -> AppResult<Option<Experiment>> {
        self.db.find_active_experiment()
    }

    /// Activates `id`, pausing whichever experiment was active, as one write.
    pub fn activate(&self, id: &str) -> AppResult<Experiment> {
        let current = self.get(id)?;
        if current.status == ExperimentStatus::Active {
            return Ok(current);
        }
        self.ensure_transition(&current, ExperimentStatus::Active)?;
        let paused = self.db.activate_experiment(id)?;
        for paused_id in &paused {
            tracing::info!(experiment_id = %paused_id, "experiment paused by activation");
        }
        tracing::info!(experiment_id = %id, "experiment activated");
        self.get(id)
    }

    pub fn pause(&self, id: &str) -> AppResult<Experiment> {
        self.transition(id, ExperimentStatus::Paused)
    }

    pub fn complete(&self, id: &str) -> AppResult<Experiment> {
        self.transition(id, ExperimentStatus::Completed)
    }

    pub fn delete(&self, id: &str) -> AppResult<()> {
        self.db.delete_experiment(id)?;
        tracing::info!(experiment_id = %id, "experiment deleted");
        Ok(())
    }

    fn transition(&self, id: &str, next: ExperimentStatus) -> AppResult<Experiment> {
        let current = self.get(id)?;
        self.ensure_transition(&current, next)?;
        self.db.update_experiment_status(id, next)?;
        tracing::info!(experiment_id = %id, status = next.as_str(), "experiment status changed");
        self.get(id)
    }

    fn ensure_transition(&self, current: &Experiment, next: ExperimentStatus) -> AppResult<()> {
        if current.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(AppError::Conflict(format!(
                "experiment {} cannot move from {} to {}",
                current.id,
                current.status.as_str(),
                next.as_str()
            )))
        }
    }

    /// Deterministic variant for a new session under the active experiment.
    pub fn assign_for_session(&self, session_id: &str) -> AppResult<Option<VariantAssignment>> {
        let Some(experiment) = self.active()? else {
            return Ok(None);
        };
        let Some(variant) = assign_variant(session_id, &experiment.id, &experiment.variants) else {
            return Ok(None);
        };
        tracing::debug!(
            session_id = %session_id,
            experiment_id = %experiment.id,
            variant = %variant.name,
            "variant assigned"
        );
        Ok(Some(VariantAssignment {
            experiment_id: experiment.id.clone(),
            variant: variant.clone(),
        }))
    }

    /// Variant stored on a conversation, if it still exists.
    pub fn variant(&self, variant_id: &str) -> AppResult<Option<Variant>> {
        self.db.get_variant(variant_id)
    }

    pub fn system_status(&self) -> AppResult<SystemStatus> {
        let active = self.active()?.map(|experiment| ActiveExperimentSummary {
            id: experiment.id,
            name: experiment.name,
            variant_count: experiment.variants.len(),
            started_at: experiment.started_at,
        });
        Ok(SystemStatus {
            active_experiment: active,
            total_conversations: self.db.count_conversations(None)?,
            total_leads: self.db.count_leads()?,
            total_outcomes: self.db.count_outcomes()?,
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (tempfile::TempDir, ExperimentService) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("clara.db")).expect("db");
        (dir, ExperimentService::new(Arc::new(db)))
    }

    #[test]
    fn templates_are_valid_experiments() {
        for summary in template_summaries() {
            let new = template(summary.key).expect("template");
            validate_new_experiment(&new).expect("valid template");
            assert_eq!(new.variants[0].name, CONTROL_VARIANT);
            assert!(new.variants[0].mutation.is_noop());
        }
        assert!(template("unknown").is_none());
    }

    #[test]
    fn rejects_experiment_without_control() {
        let mut new = template("greetingStyle").expect("template");
        new.variants[0].name = "baseline".to_string();
        let err = validate_new_experiment(&new).expect_err("no control");
        assert!(err.to_string().starts_with("INVALID_INPUT"));

        let mut single = template("greetingStyle").expect("template");
        single.variants.truncate(1);
        assert!(validate_new_experiment(&single).is_err());
    }

    #[test]
    fn lifecycle_enforces_transitions() {
        let (_dir, service) = service();
        let experiment = service.create_from_template("greetingStyle").expect("create");
        assert_eq!(experiment.status, ExperimentStatus::Draft);

        let err = service.pause(&experiment.id).expect_err("draft cannot pause");
        assert!(err.to_string().starts_with("CONFLICT"));

        service.activate(&experiment.id).expect("activate");
        let paused = service.pause(&experiment.id).expect("pause");
        assert_eq!(paused.status, ExperimentStatus::Paused);

        let completed = service.complete(&experiment.id).expect("complete");
        assert_eq!(completed.status, ExperimentStatus::Completed);
        assert!(completed.ended_at.is_some());
        assert!(service.activate(&experiment.id).is_err());
    }

    #[test]
    fn only_one_experiment_is_active() {
        let (_dir, service) = service();
        let first = service.create_from_template("greetingStyle").expect("first");
        let second = service.create_from_template("specificityTest").expect("second");
        service.activate(&first.id).expect("first active");
        service.activate(&second.id).expect("second active");

        let statuses: Vec<_> = service
            .list()
            .expect("list")
            .into_iter()
            .map(|experiment| (experiment.id, experiment.status))
            .collect();
        let active: Vec<_> = statuses
            .iter()
            .filter(|(_, status)| *status == ExperimentStatus::Active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].0, second.id);
    }

    #[test]
    fn session_assignment_uses_active_experiment() {
        let (_dir, service) = service();
        assert!(service.assign_for_session("visitor").expect("none").is_none());

        let experiment = service.create_from_template("specificityTest").expect("create");
        service.activate(&experiment.id).expect("activate");

        let first = service.assign_for_session("visitor").expect("assign").expect("some");
        let again = service.assign_for_session("visitor").expect("assign").expect("some");
        assert_eq!(first.experiment_id, experiment.id);
        assert_eq!(first.variant.id, again.variant.id);

        let status = service.system_status().expect("status");
        assert_eq!(status.active_experiment.map(|summary| summary.variant_count), Some(2));
    }
}
