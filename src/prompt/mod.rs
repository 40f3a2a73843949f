//! The instruction document sent with every completion request.

use crate::errors::{AppError, AppResult};
use crate::experiments::apply_mutation;
use crate::models::PromptMutation;
use std::fs;
use std::path::Path;

pub const BASE_PROMPT: &str = include_str!("system.md");

/// What the caller knows about the visitor for this turn.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptContext<'a> {
    pub current_page: Option<&'a str>,
    pub company_name: Option<&'a str>,
    pub visitor_name: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    base: String,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(BASE_PROMPT)
    }
}

impl PromptBuilder {
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    /// Reads the base document from `path`, or uses the bundled one.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let base = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read prompt {}: {}", path.display(), err)))?;
        if base.trim().is_empty() {
            return Err(AppError::Config(format!("prompt {} is empty", path.display())));
        }
        Ok(Self::new(base))
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Base document, shaped by the variant's directive, followed by the visitor context.
    pub fn build(&self, mutation: Option<&PromptMutation>, context: &PromptContext<'_>) -> String {
        let mut prompt = match mutation {
            Some(mutation) => apply_mutation(&self.base, mutation),
            None => self.base.clone(),
        };
        prompt.push_str(&context_section(context));
        prompt
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Trailing `## CURRENT CONTEXT` block; empty when nothing is known.
pub fn context_section(context: &PromptContext<'_>) -> String {
    let mut section = String::new();
    if let Some(page) = non_empty(context.current_page) {
        section.push_str("\n\n## CURRENT CONTEXT\nThe visitor is currently on: ");
        section.push_str(page);
    }
    if let Some(company) = non_empty(context.company_name) {
        section.push_str("\nYou know they are from: ");
        section.push_str(company);
    }
    if let Some(name) = non_empty(context.visitor_name) {
        section.push_str("\nTheir name is: ");
        section.push_str(name);
    }
    section
}
