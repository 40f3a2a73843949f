use super::{parse_input, ToolHandler};
use crate::completion::ToolSpec;
use crate::config::SchedulingConfig;
use crate::models::{ToolContext, ToolResult};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Solution {
    pub id: &'static str,
    pub name: &'static str,
    pub tagline: &'static str,
    pub url: &'static str,
    pub highlights: [&'static str; 3],
    pub next_step: &'static str,
}

pub const SOLUTIONS: [Solution; 4] = [
    Solution {
        id: "ai-assessment",
        name: "AI Workforce Assessment",
        tagline: "Find the capacity you didn't know you had",
        url: "/agentic-assessment",
        highlights: [
            "5 weeks, board-ready deliverables",
            "Starting at $25K (vs. Big 5's $250K+)",
            "Process mapping, task segmentation, implementation roadmap",
        ],
        next_step: "executive-briefing",
    },
    Solution {
        id: "outsourced-ld",
        name: "Outsourced L&D",
        tagline: "Enterprise L&D capabilities at mid-market investment",
        url: "/outsourced-ld",
        highlights: [
            "Full L&D for the cost of a training coordinator",
            "Strategy, design, development, delivery, measurement",
            "94% of employees stay longer with development investment",
        ],
        next_step: "discovery-call",
    },
    Solution {
        id: "talent-consulting",
        name: "Talent Consulting",
        tagline: "Strategic transformation that actually transforms",
        url: "/talent-development/talent-consulting",
        highlights: [
            "Discover → Design → Deliver → Sustain methodology",
            "Implementation support, not just recommendations",
            "20+ years of organizational transformation expertise",
        ],
        next_step: "discovery-call",
    },
    Solution {
        id: "training-solutions",
        name: "Training Solutions",
        tagline: "Award-winning training that drives behavior change",
        url: "/training-materials",
        highlights: [
            "eLearning, ILT/VILT, motion graphics",
            "Multiple Telly Award winners",
            "Custom design, not off-the-shelf",
        ],
        next_step: "project-scoping",
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub path: &'static str,
    pub title: &'static str,
    pub description: &'static str,
}

const fn page(path: &'static str, title: &'static str, description: &'static str) -> Page {
    Page {
        path,
        title,
        description,
    }
}

pub const PAGES: [Page; 14] = [
    page("/agentic-assessment", "AI Workforce Assessment", "Learn about our 5-week board-ready assessment"),
    page("/agentic-assessment/process-mapping", "Process Mapping", "See how we document your workflows"),
    page(
        "/agentic-assessment/task-segmentation",
        "Task Segmentation",
        "Understand AI-ready vs human-essential tasks",
    ),
    page("/outsourced-ld", "Outsourced L&D", "Full L&D capabilities for your organization"),
    page(
        "/talent-development/talent-consulting",
        "Talent Consulting",
        "Strategic organizational transformation",
    ),
    page("/training-materials", "Training Solutions", "Award-winning custom training content"),
    page("/training-materials/elearning", "eLearning Solutions", "Interactive, SCORM-compliant courses"),
    page("/training-materials/motion-graphics", "Motion Graphics", "Telly Award-winning animated videos"),
    page("/training-materials/ilt-vilt", "ILT/VILT", "Instructor-led training materials"),
    page("/roi-calculator", "ROI Calculator", "Calculate your AI opportunity"),
    page("/why-sdi", "Why SDI", "See how we compare to Big 5 consulting"),
    page("/portfolio", "Portfolio", "View our award-winning work samples"),
    page("/contact", "Contact", "Get in touch with SDI"),
    page("/blog", "Blog", "20+ years of thought leadership"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Briefing {
    pub id: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub duration: &'static str,
    pub best_for: &'static str,
}

pub const BRIEFINGS: [Briefing; 3] = [
    Briefing {
        id: "executive-briefing",
        title: "Executive Briefing",
        description: "A 30-minute call to discuss your specific situation and explore how SDI can help.",
        duration: "30 minutes",
        best_for: "C-Suite and senior leaders exploring AI workforce optimization",
    },
    Briefing {
        id: "discovery-call",
        title: "Discovery Call",
        description: "A conversation to understand your challenges and discuss potential solutions.",
        duration: "30 minutes",
        best_for: "HR and L&D leaders exploring outsourced partnerships",
    },
    Briefing {
        id: "project-scoping",
        title: "Project Scoping Call",
        description: "Let's discuss your specific training project and provide a tailored proposal.",
        duration: "30 minutes",
        best_for: "L&D teams with specific training content needs",
    },
];

pub fn solution(id: &str) -> Option<&'static Solution> {
    SOLUTIONS.iter().find(|solution| solution.id == id)
}

pub fn page_info(path: &str) -> Option<&'static Page> {
    PAGES.iter().find(|page| page.path == path)
}

pub fn briefing(id: &str) -> Option<&'static Briefing> {
    BRIEFINGS.iter().find(|briefing| briefing.id == id)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecommendInput {
    solution: String,
    reason: String,
    key_benefits: Option<Vec<String>>,
}

#[derive(Debug, Default)]
pub struct RecommendSolutionTool;

#[async_trait]
impl ToolHandler for RecommendSolutionTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "recommend_solution".to_string(),
            description: "Formally recommend an SDI solution based on discovery. Use this after gathering enough context to make an informed recommendation.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "solution": {
                        "type": "string",
                        "enum": SOLUTIONS.iter().map(|solution| solution.id).collect::<Vec<_>>(),
                        "description": "The recommended solution"
                    },
                    "reason": { "type": "string", "description": "Why this solution fits their needs" },
                    "keyBenefits": { "type": "array", "items": { "type": "string" }, "description": "Top 3 benefits for their situation" }
                },
                "required": ["solution", "reason"]
            }),
        }
    }

    async fn call(&self, input: Value, _context: &ToolContext) -> ToolResult {
        let input: RecommendInput = match parse_input("recommend_solution", input) {
            Ok(input) => input,
            Err(failure) => return failure,
        };
        let Some(details) = solution(&input.solution) else {
            return ToolResult::failure("Unknown solution type");
        };
        let benefits = input
            .key_benefits
            .filter(|benefits| !benefits.is_empty())
            .unwrap_or_else(|| details.highlights.iter().map(ToString::to_string).collect());
        let data = json!({
            "solution": details.name,
            "tagline": details.tagline,
            "url": details.url,
            "reason": input.reason,
            "benefits": benefits,
            "suggestedNextStep": details.next_step,
        });
        let message = format!("Based on your situation, I recommend {}: {}", details.name, input.reason);
        ToolResult::ok(data, message, true)
    }
}

#[derive(Debug, Deserialize)]
struct NavigateInput {
    page: String,
    reason: Option<String>,
}

#[derive(Debug, Default)]
pub struct NavigateToPageTool;

#[async_trait]
impl ToolHandler for NavigateToPageTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "navigate_to_page".to_string(),
            description: "Suggest navigating the visitor to a relevant SDI page for more information.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "page": {
                        "type": "string",
                        "enum": PAGES.iter().map(|page| page.path).collect::<Vec<_>>(),
                        "description": "The page to navigate to"
                    },
                    "reason": { "type": "string", "description": "Why this page is relevant" }
                },
                "required": ["page"]
            }),
        }
    }

    async fn call(&self, input: Value, _context: &ToolContext) -> ToolResult {
        let input: NavigateInput = match parse_input("navigate_to_page", input) {
            Ok(input) => input,
            Err(failure) => return failure,
        };
        let Some(page) = page_info(&input.page) else {
            return ToolResult::failure("Unknown page");
        };
        let reason = input.reason.filter(|reason| !reason.trim().is_empty());
        let message = match &reason {
            Some(reason) => format!("I suggest checking out our {} page: {}.", page.title, reason),
            None => format!("I suggest checking out our {} page.", page.title),
        };
        let data = json!({
            "url": page.path,
            "title": page.title,
            "description": page.description,
            "reason": reason,
        });
        ToolResult::ok(data, message, true)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BriefingInput {
    briefing_type: String,
    context: Option<String>,
}

/// Booking link carrying attribution back to the conversation and variant.
pub fn booking_link(scheduling: &SchedulingConfig, context: &ToolContext) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(&scheduling.booking_url)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("utm_source", &scheduling.utm_source);
        query.append_pair("utm_medium", "chat");
        query.append_pair("utm_content", &context.conversation_id);
        if let Some(experiment_id) = context.experiment_id.as_deref() {
            query.append_pair("utm_campaign", experiment_id);
        }
        if let Some(variant) = context.variant_name.as_deref() {
            query.append_pair("utm_term", variant);
        }
    }
    Ok(url)
}

#[derive(Debug, Clone)]
pub struct ScheduleBriefingTool {
    scheduling: SchedulingConfig,
}

impl ScheduleBriefingTool {
    pub fn new(scheduling: SchedulingConfig) -> Self {
        Self { scheduling }
    }
}

#[async_trait]
impl ToolHandler for ScheduleBriefingTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "schedule_briefing".to_string(),
            description: "Present the option to schedule a briefing call. Use this for qualified leads who are ready for next steps.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "briefingType": {
                        "type": "string",
                        "enum": BRIEFINGS.iter().map(|briefing| briefing.id).collect::<Vec<_>>(),
                        "description": "Type of call to schedule"
                    },
                    "context": { "type": "string", "description": "Brief context about what they want to discuss" }
                },
                "required": ["briefingType"]
            }),
        }
    }

    async fn call(&self, input: Value, context: &ToolContext) -> ToolResult {
        let input: BriefingInput = match parse_input("schedule_briefing", input) {
            Ok(input) => input,
            Err(failure) => return failure,
        };
        let Some(info) = briefing(&input.briefing_type) else {
            return ToolResult::failure("Unknown briefing type");
        };
        let link = match booking_link(&self.scheduling, context) {
            Ok(link) => link,
            Err(err) => {
                tracing::error!(conversation_id = %context.conversation_id, error = %err, "invalid booking URL");
                return ToolResult::failure("Scheduling is unavailable right now");
            }
        };
        let data = json!({
            "type": info.id,
            "title": info.title,
            "description": info.description,
            "duration": info.duration,
            "bestFor": info.best_for,
            "calendlyUrl": link.as_str(),
            "context": input.context,
        });
        let message = format!(
            "Would you like to schedule a {}? It's {} to discuss your specific situation.",
            info.title, info.duration
        );
        ToolResult::ok(data, message, true)
    }
}
