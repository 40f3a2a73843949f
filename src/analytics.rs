use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::experiments::CONTROL_VARIANT;
use crate::models::{Experiment, ExperimentStatus, Outcome, OutcomeLabel, Variant};
use crate::stats::{summarize_experiment, SignificanceResult, VariantStats};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantBreakdown {
    pub variant_name: String,
    pub outcomes: BTreeMap<String, u64>,
    pub avg_messages: f64,
    pub avg_duration_minutes: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentReport {
    pub experiment_id: String,
    pub name: String,
    pub status: ExperimentStatus,
    pub target_size: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub variant_stats: Vec<VariantStats>,
    pub significance_results: Vec<SignificanceResult>,
    pub outcome_breakdown: Vec<VariantBreakdown>,
    pub summary: String,
    pub winner: Option<String>,
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantOverview {
    pub id: String,
    pub name: String,
    pub weight: u32,
    pub conversation_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentOverview {
    pub id: String,
    pub name: String,
    pub status: ExperimentStatus,
    pub target_size: u32,
    pub variants: Vec<VariantOverview>,
    pub total_conversations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodSummary {
    pub period: String,
    pub total_conversations: u64,
    pub tracked_outcomes: u64,
    pub outcomes: BTreeMap<String, u64>,
    pub conversion_rates: BTreeMap<String, String>,
    pub avg_messages: f64,
    pub avg_duration_minutes: f64,
}

/// Builds the report from each variant's recorded outcomes, in declared variant order.
pub fn experiment_report(experiment: &Experiment, outcomes: &[(Variant, Vec<Outcome>)]) -> ExperimentReport {
    let variant_stats: Vec<VariantStats> = outcomes
        .iter()
        .map(|(variant, recorded)| {
            let conversions = recorded.iter().filter(|outcome| outcome.label.is_conversion()).count();
            VariantStats::new(variant.name.clone(), conversions as u64, recorded.len() as u64)
        })
        .collect();

    let control_index = variant_stats
        .iter()
        .position(|stats| stats.name == CONTROL_VARIANT)
        .unwrap_or(0);
    let others: Vec<VariantStats> = variant_stats
        .iter()
        .enumerate()
        .filter(|(index, _)| *index != control_index)
        .map(|(_, stats)| stats.clone())
        .collect();

    let summary = match variant_stats.get(control_index) {
        Some(control) => summarize_experiment(control, &others),
        None => summarize_experiment(&VariantStats::new(CONTROL_VARIANT, 0, 0), &[]),
    };

    let outcome_breakdown = outcomes
        .iter()
        .map(|(variant, recorded)| breakdown(&variant.name, recorded))
        .collect();

    ExperimentReport {
        experiment_id: experiment.id.clone(),
        name: experiment.name.clone(),
        status: experiment.status,
        target_size: experiment.target_size,
        started_at: experiment.started_at,
        ended_at: experiment.ended_at,
        variant_stats,
        significance_results: summary.results,
        outcome_breakdown,
        summary: summary.summary,
        winner: summary.winner,
        recommendation: summary.overall_recommendation,
    }
}

fn breakdown(variant_name: &str, recorded: &[Outcome]) -> VariantBreakdown {
    let (avg_messages, avg_duration_minutes) = averages(recorded);
    VariantBreakdown {
        variant_name: variant_name.to_string(),
        outcomes: count_labels(recorded),
        avg_messages,
        avg_duration_minutes,
    }
}

fn count_labels(recorded: &[Outcome]) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for outcome in recorded {
        *counts.entry(outcome.label.as_str().to_string()).or_insert(0) += 1;
    }
    counts
}

/// Mean messages and mean duration in minutes, both to one decimal.
fn averages(recorded: &[Outcome]) -> (f64, f64) {
    if recorded.is_empty() {
        return (0.0, 0.0);
    }
    let n = recorded.len() as f64;
    let messages = recorded.iter().map(|outcome| outcome.message_count as f64).sum::<f64>() / n;
    let seconds = recorded.iter().map(|outcome| outcome.duration_sec as f64).sum::<f64>() / n;
    ((messages * 10.0).round() / 10.0, (seconds / 6.0).round() / 10.0)
}

fn percent(count: u64, total: u64) -> String {
    if total == 0 {
        return "0%".to_string();
    }
    format!("{:.1}%", count as f64 / total as f64 * 100.0)
}

#[derive(Clone)]
pub struct Analytics {
    db: Arc<Database>,
}

impl Analytics {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn experiment_report(&self, experiment_id: &str) -> AppResult<ExperimentReport> {
        let experiment = self
            .db
            .get_experiment(experiment_id)?
            .ok_or_else(|| AppError::NotFound(format!("experiment {}", experiment_id)))?;
        let outcomes = self.outcomes_by_variant(&experiment)?;
        Ok(experiment_report(&experiment, &outcomes))
    }

    pub fn experiment_overviews(&self) -> AppResult<Vec<ExperimentOverview>> {
        let mut overviews = Vec::new();
        for experiment in self.db.list_experiments()? {
            let outcomes = self.outcomes_by_variant(&experiment)?;
            let variants: Vec<VariantOverview> = outcomes
                .iter()
                .map(|(variant, recorded)| VariantOverview {
                    id: variant.id.clone(),
                    name: variant.name.clone(),
                    weight: variant.weight,
                    conversation_count: recorded.len(),
                })
                .collect();
            overviews.push(ExperimentOverview {
                id: experiment.id,
                name: experiment.name,
                status: experiment.status,
                target_size: experiment.target_size,
                total_conversations: variants.iter().map(|variant| variant.conversation_count).sum(),
                variants,
            });
        }
        Ok(overviews)
    }

    /// Outcome counts and conversion rates over the trailing `days`.
    pub fn period_summary(&self, days: u32, now: DateTime<Utc>) -> AppResult<PeriodSummary> {
        let since = now - Duration::days(i64::from(days));
        let recorded = self.db.list_outcomes_since(since)?;
        let total_conversations = self.db.count_conversations(Some(since))?;

        let outcomes = count_labels(&recorded);
        let tracked = recorded.len() as u64;
        let conversion_rates = OutcomeLabel::ALL
            .iter()
            .map(|label| {
                let count = outcomes.get(label.as_str()).copied().unwrap_or(0);
                (label.as_str().to_lowercase(), percent(count, tracked))
            })
            .collect();
        let (avg_messages, avg_duration_minutes) = averages(&recorded);

        Ok(PeriodSummary {
            period: format!("Last {} days", days),
            total_conversations,
            tracked_outcomes: tracked,
            outcomes,
            conversion_rates,
            avg_messages,
            avg_duration_minutes,
        })
    }

    fn outcomes_by_variant(&self, experiment: &Experiment) -> AppResult<Vec<(Variant, Vec<Outcome>)>> {
        experiment
            .variants
            .iter()
            .map(|variant| Ok((variant.clone(), self.db.list_outcomes_for_variant(&variant.id)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PromptMutation;

    fn variant(name: &str) -> Variant {
        Variant {
            id: format!("v-{}", name),
            experiment_id: "exp".to_string(),
            name: name.to_string(),
            description: None,
            weight: 50,
            mutation: PromptMutation::noop(),
        }
    }

    fn recorded(label: OutcomeLabel, messages: u32, duration_sec: i64) -> Outcome {
        Outcome {
            conversation_id: "c".to_string(),
            variant_id: None,
            label,
            classified_at: Utc::now(),
            message_count: messages,
            duration_sec,
            visitor_role: None,
            company_size: None,
            industry: None,
            primary_interest: None,
        }
    }

    fn experiment() -> Experiment {
        Experiment {
            id: "exp".to_string(),
            name: "Greeting Style Test".to_string(),
            description: None,
            status: ExperimentStatus::Active,
            target_size: 100,
            variants: vec![variant("direct_opener"), variant("control")],
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    #[test]
    fn report_uses_named_control_and_counts_conversions() {
        let outcomes = vec![
            (
                variant("direct_opener"),
                vec![
                    recorded(OutcomeLabel::Scheduled, 10, 600),
                    recorded(OutcomeLabel::Qualified, 8, 300),
                    recorded(OutcomeLabel::Bounced, 2, 30),
                ],
            ),
            (
                variant("control"),
                vec![recorded(OutcomeLabel::Interested, 4, 120), recorded(OutcomeLabel::Bounced, 1, 0)],
            ),
        ];
        let report = experiment_report(&experiment(), &outcomes);

        assert_eq!(report.variant_stats[0].conversions, 2);
        assert_eq!(report.variant_stats[1].conversions, 0);
        assert_eq!(report.significance_results.len(), 1);
        assert_eq!(report.significance_results[0].variant, "direct_opener");
        assert!(report.summary.contains("- Control: control"));

        let breakdown = &report.outcome_breakdown[0];
        assert_eq!(breakdown.outcomes.get("SCHEDULED"), Some(&1));
        assert_eq!(breakdown.avg_messages, 6.7);
        assert_eq!(breakdown.avg_duration_minutes, 5.2);
    }

    #[test]
    fn empty_experiment_reports_insufficient_data() {
        let outcomes = vec![(variant("control"), Vec::new()), (variant("direct_opener"), Vec::new())];
        let report = experiment_report(&experiment(), &outcomes);
        assert!(report.winner.is_none());
        assert!(!report.significance_results[0].significant);
        assert_eq!(report.outcome_breakdown[0].avg_messages, 0.0);
    }

    #[test]
    fn period_summary_reports_rates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("clara.db")).expect("db"));
        for (session, label) in [("a", OutcomeLabel::Scheduled), ("b", OutcomeLabel::Bounced), ("c", OutcomeLabel::Bounced), ("d", OutcomeLabel::Interested)] {
            let conversation = db.insert_conversation(session, None, None).expect("conversation");
            let mut outcome = recorded(label, 3, 60);
            outcome.conversation_id = conversation.id;
            db.upsert_outcome(&outcome).expect("outcome");
        }

        let summary = Analytics::new(db).period_summary(30, Utc::now()).expect("summary");
        assert_eq!(summary.total_conversations, 4);
        assert_eq!(summary.tracked_outcomes, 4);
        assert_eq!(summary.conversion_rates.get("scheduled").map(String::as_str), Some("25.0%"));
        assert_eq!(summary.conversion_rates.get("bounced").map(String::as_str), Some("50.0%"));
        assert_eq!(summary.conversion_rates.get("qualified").map(String::as_str), Some("0.0%"));
        assert_eq!(summary.avg_duration_minutes, 1.0);
    }
}
