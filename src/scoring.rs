//! Rule-based lead qualification.
//!
//! One point model serves both the persisted lead record and the ad hoc
//! `get_qualification` tool. The two callers differ only in the bands a
//! [`ScoringProfile`] switches on; keyword tables and tier thresholds are shared.

use crate::models::{Lead, LeadQuality};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const COMPANY_FIT_MAX: u32 = 40;
pub const AUTHORITY_MAX: u32 = 30;
pub const INTENT_MAX: u32 = 30;
pub const TOTAL_MAX: u32 = COMPANY_FIT_MAX + AUTHORITY_MAX + INTENT_MAX;

pub const HOT_THRESHOLD: u32 = 70;
pub const WARM_THRESHOLD: u32 = 40;

const TARGET_INDUSTRIES: &[&str] = &[
    "healthcare",
    "financial",
    "banking",
    "manufacturing",
    "technology",
    "professional services",
    "insurance",
    "retail",
    "energy",
    "utilities",
];

// Role tiers are regex fragments so titles like "SVP" or "Managers" land in their tier
// while "lead" stays out of "leadership" and "cto" out of "director".
const EXECUTIVE_PATTERNS: &[&str] = &["c-suite", "c-level", "chief", "ceo", "coo", "cfo", "cto", "chro"];
const DIRECTOR_PATTERNS: &[&str] = &[r"[se]?vps?", r"vice[\s-]+presidents?", "directors?", r"heads?\s+of"];
const MANAGER_PATTERNS: &[&str] = &["managers?", "managing", "leads?"];
const CONTRIBUTOR_PATTERNS: &[&str] = &["individual", "contributors?", "analysts?", "specialists?"];

const URGENT_TIMELINE: &[&str] = &[
    "this quarter",
    "immediate",
    "immediately",
    "asap",
    "urgent",
    "urgently",
    "this month",
];
const NEAR_TIMELINE: &[&str] = &["next quarter", "soon", "few months", "q1", "q2", "q3", "q4"];

static SIZE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{1,3}(?:,\d{3})+|\d+").expect("valid size regex"));

static INDUSTRY_RE: Lazy<Regex> = Lazy::new(|| keyword_regex(TARGET_INDUSTRIES));
static EXECUTIVE_RE: Lazy<Regex> = Lazy::new(|| pattern_regex(EXECUTIVE_PATTERNS));
static DIRECTOR_RE: Lazy<Regex> = Lazy::new(|| pattern_regex(DIRECTOR_PATTERNS));
static MANAGER_RE: Lazy<Regex> = Lazy::new(|| pattern_regex(MANAGER_PATTERNS));
static CONTRIBUTOR_RE: Lazy<Regex> = Lazy::new(|| pattern_regex(CONTRIBUTOR_PATTERNS));
static URGENT_RE: Lazy<Regex> = Lazy::new(|| keyword_regex(URGENT_TIMELINE));
static NEAR_RE: Lazy<Regex> = Lazy::new(|| keyword_regex(NEAR_TIMELINE));

fn keyword_regex(keywords: &[&str]) -> Regex {
    let escaped = keywords.iter().map(|keyword| regex::escape(keyword)).collect::<Vec<_>>();
    bounded_alternation(&escaped)
}

fn pattern_regex(patterns: &[&str]) -> Regex {
    let owned = patterns.iter().map(|pattern| pattern.to_string()).collect::<Vec<_>>();
    bounded_alternation(&owned)
}

fn bounded_alternation(alternatives: &[String]) -> Regex {
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|"))).expect("valid keyword regex")
}

/// Which optional bands a scoring path awards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoringProfile {
    /// Points for a company in (2500, 5000]; `None` awards nothing.
    pub oversize_points: Option<u32>,
    /// Points for individual-contributor roles; `None` awards nothing.
    pub contributor_points: Option<u32>,
}

impl ScoringProfile {
    /// Scoring applied to stored leads by `capture_lead` and the outcome tracker.
    pub const PERSISTED: ScoringProfile = ScoringProfile {
        oversize_points: None,
        contributor_points: None,
    };

    /// Scoring applied by the stateless `get_qualification` tool.
    pub const ADHOC: ScoringProfile = ScoringProfile {
        oversize_points: Some(15),
        contributor_points: Some(5),
    };

    pub fn score(&self, input: &ScoringInput<'_>) -> ScoreBreakdown {
        let company_fit = self.company_fit(input.company_size, input.industry);
        let authority = self.authority(input.role_level.or(input.role));
        let intent = intent_score(input.has_pain_point, input.timeline);
        ScoreBreakdown::new(company_fit, authority, intent)
    }

    fn company_fit(&self, company_size: Option<&str>, industry: Option<&str>) -> u32 {
        let numbers = company_size.map(parse_size_numbers).unwrap_or_default();
        let mut points = if numbers.iter().any(|n| (500..=2500).contains(n)) {
            40
        } else if numbers.iter().any(|n| (100..500).contains(n)) {
            20
        } else if numbers.iter().any(|n| *n > 2500 && *n <= 5000) {
            self.oversize_points.unwrap_or(0)
        } else {
            0
        };

        if industry.is_some_and(|text| INDUSTRY_RE.is_match(text)) {
            points = (points + 10).min(COMPANY_FIT_MAX);
        }
        points
    }

    fn authority(&self, role_text: Option<&str>) -> u32 {
        let Some(text) = role_text.map(str::trim).filter(|text| !text.is_empty()) else {
            return 0;
        };
        if EXECUTIVE_RE.is_match(text) {
            30
        } else if DIRECTOR_RE.is_match(text) {
            20
        } else if MANAGER_RE.is_match(text) {
            10
        } else if CONTRIBUTOR_RE.is_match(text) {
            self.contributor_points.unwrap_or(0)
        } else {
            0
        }
    }
}

fn intent_score(has_pain_point: bool, timeline: Option<&str>) -> u32 {
    let mut points = if has_pain_point { 20 } else { 0 };
    if let Some(text) = timeline {
        if URGENT_RE.is_match(text) {
            points += 10;
        } else if NEAR_RE.is_match(text) {
            points += 5;
        }
    }
    points.min(INTENT_MAX)
}

/// Integers in a free-text size description, thousands separators honoured.
pub fn parse_size_numbers(text: &str) -> Vec<u64> {
    SIZE_NUMBER
        .find_iter(text)
        .filter_map(|found| found.as_str().replace(',', "").parse::<u64>().ok())
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScoringInput<'a> {
    pub company_size: Option<&'a str>,
    pub industry: Option<&'a str>,
    pub role: Option<&'a str>,
    pub role_level: Option<&'a str>,
    pub has_pain_point: bool,
    pub timeline: Option<&'a str>,
}

impl<'a> ScoringInput<'a> {
    pub fn from_lead(lead: &'a Lead) -> Self {
        Self {
            company_size: lead.company_size.as_deref(),
            industry: lead.industry.as_deref(),
            role: lead.role.as_deref(),
            role_level: lead.role_level.as_deref(),
            has_pain_point: !lead.pain_points.is_empty(),
            timeline: lead.timeline.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub company_fit_score: u32,
    pub authority_score: u32,
    pub intent_score: u32,
    pub total_score: u32,
    pub quality: LeadQuality,
}

impl ScoreBreakdown {
    pub fn new(company_fit: u32, authority: u32, intent: u32) -> Self {
        let total = (company_fit + authority + intent).min(TOTAL_MAX);
        Self {
            company_fit_score: company_fit,
            authority_score: authority,
            intent_score: intent,
            total_score: total,
            quality: quality_for(total),
        }
    }
}

pub fn quality_for(total: u32) -> LeadQuality {
    if total >= HOT_THRESHOLD {
        LeadQuality::Hot
    } else if total >= WARM_THRESHOLD {
        LeadQuality::Warm
    } else if total > 0 {
        LeadQuality::Cold
    } else {
        LeadQuality::Unknown
    }
}

pub fn recommended_action(quality: LeadQuality) -> &'static str {
    match quality {
        LeadQuality::Hot => "Present executive briefing option - this is a highly qualified lead",
        LeadQuality::Warm => "Continue discovery, address hesitations, offer relevant resources",
        LeadQuality::Cold => "Provide value, nurture relationship, avoid pushing next steps",
        LeadQuality::Unknown => "Gather more information about company size, role, and challenges",
    }
}
