use crate::models::{MutationKind, PromptMutation};
use std::ops::Range;

/// Applies a variant's directive to the base instruction document.
///
/// Sections are `## NAME` heading lines; a section runs until the next `\n## ` or the end of
/// the document. A directive naming a section that does not exist leaves the document as is.
pub fn apply_mutation(base: &str, mutation: &PromptMutation) -> String {
    if mutation.is_noop() {
        return base.to_string();
    }
    let content = mutation.content.as_str();
    let section = mutation.section.as_deref().map(str::trim).filter(|name| !name.is_empty());

    let Some(section) = section else {
        return match mutation.kind {
            MutationKind::Append => format!("{}\n{}", base, content),
            MutationKind::Prepend => format!("{}\n{}", content, base),
            MutationKind::Replace => content.to_string(),
        };
    };

    let Some(range) = find_section(base, section) else {
        return base.to_string();
    };

    let mut out = String::with_capacity(base.len() + content.len() + section.len() + 8);
    match mutation.kind {
        MutationKind::Append => {
            out.push_str(&base[..range.end]);
            out.push('\n');
            out.push_str(content);
            out.push_str(&base[range.end..]);
        }
        MutationKind::Prepend => {
            out.push_str(&base[..range.start]);
            out.push_str(content);
            out.push('\n');
            out.push_str(&base[range.start..]);
        }
        MutationKind::Replace => {
            out.push_str(&base[..range.start]);
            out.push_str("## ");
            out.push_str(section);
            out.push('\n');
            out.push_str(content);
            out.push_str(&base[range.end..]);
        }
    }
    out
}

/// Byte range from the heading line through the end of the section body.
fn find_section(document: &str, section: &str) -> Option<Range<usize>> {
    let heading = format!("## {}", section);
    let mut offset = 0;
    let start = loop {
        let line_end = document[offset..]
            .find('\n')
            .map(|index| offset + index)
            .unwrap_or(document.len());
        if document[offset..line_end].trim_end() == heading {
            break offset;
        }
        if line_end >= document.len() {
            return None;
        }
        offset = line_end + 1;
    };

    let body_start = start + heading.len();
    let end = document[body_start..]
        .find("\n## ")
        .map(|index| body_start + index)
        .unwrap_or(document.len());
    Some(start..end)
}
