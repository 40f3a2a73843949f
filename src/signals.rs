use crate::models::{Message, MessageRole};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static PRICING_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)how much",
        r"(?i)cost",
        r"(?i)pricing",
        r"(?i)price",
        r"(?i)budget",
        r"(?i)invest(ment)?",
        r"\$\d+",
        r"(?i)what('s| is) the (cost|price|investment)",
        r"(?i)afford",
        r"(?i)expensive",
        r"(?i)cheap",
    ])
});

static PROCESS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)how (does|do) (it|this|you) work",
        r"(?i)next step",
        r"(?i)process",
        r"(?i)how long",
        r"(?i)start(ing)?",
        r"(?i)begin",
        r"(?i)get started",
        r"(?i)what happens next",
        r"(?i)what('s| is) the process",
    ])
});

static TIMELINE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)when can",
        r"(?i)how soon",
        r"(?i)this quarter",
        r"(?i)this year",
        r"(?i)timeline",
        r"(?i)schedule",
        r"(?i)available",
        r"(?i)book",
        r"(?i)calendar",
        r"(?i)meet(ing)?",
    ])
});

static SCHEDULING_LINK_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)calendly",
        r"(?i)schedule.*call",
        r"(?i)book.*time",
        r"(?i)executive briefing",
    ])
});

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|pattern| Regex::new(pattern).expect("valid signal regex"))
        .collect()
}

fn any_match(patterns: &[Regex], text: &str) -> bool {
    patterns.iter().any(|pattern| pattern.is_match(text))
}

/// Intent flags detected across a visitor's side of a conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentSignals {
    pub asked_about_pricing: bool,
    pub asked_about_process: bool,
    pub asked_about_timeline: bool,
    pub scheduling_link_clicked: bool,
}

impl IntentSignals {
    pub fn from_text(text: &str) -> Self {
        Self {
            asked_about_pricing: any_match(&PRICING_PATTERNS, text),
            asked_about_process: any_match(&PROCESS_PATTERNS, text),
            asked_about_timeline: any_match(&TIMELINE_PATTERNS, text),
            scheduling_link_clicked: any_match(&SCHEDULING_LINK_PATTERNS, text),
        }
    }

    pub fn shows_buying_intent(&self) -> bool {
        self.asked_about_pricing || self.asked_about_process || self.scheduling_link_clicked
    }
}

/// Visitor messages joined with spaces, then matched as one text.
pub fn analyze_messages(messages: &[Message]) -> IntentSignals {
    let text = messages
        .iter()
        .filter(|message| message.role == MessageRole::Visitor)
        .map(|message| message.content.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    IntentSignals::from_text(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(role: MessageRole, content: &str) -> Message {
        Message {
            id: "m".to_string(),
            conversation_id: "c".to_string(),
            role,
            content: content.to_string(),
            tool_calls: None,
            tool_results: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn detects_pricing_and_dollar_amounts() {
        assert!(IntentSignals::from_text("How much does the assessment run?").asked_about_pricing);
        assert!(IntentSignals::from_text("we have $40000 set aside").asked_about_pricing);
        assert!(!IntentSignals::from_text("tell me about your team").asked_about_pricing);
    }

    #[test]
    fn detects_scheduling_link_intent() {
        let signals = IntentSignals::from_text("Can I schedule a call with Jeremy?");
        assert!(signals.scheduling_link_clicked);
        assert!(signals.asked_about_timeline);
        assert!(signals.shows_buying_intent());
    }

    #[test]
    fn ignores_agent_messages() {
        let messages = vec![
            message(MessageRole::Visitor, "Hi, who are you?"),
            message(MessageRole::Agent, "Our pricing starts at $25K and the process takes 5 weeks."),
        ];
        assert_eq!(analyze_messages(&messages), IntentSignals::default());
    }

    #[test]
    fn matches_across_joined_visitor_messages() {
        let messages = vec![
            message(MessageRole::Visitor, "what happens"),
            message(MessageRole::Visitor, "next with the rollout"),
        ];
        assert!(analyze_messages(&messages).asked_about_process);
    }
}
