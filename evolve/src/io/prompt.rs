//! Prompt rendering for the model request.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::types::StateSnapshot;
use crate::io::context::{ContextBundle, ContextContent};

const EVOLVE_TEMPLATE: &str = include_str!("prompts/evolve.md");

/// System message sent ahead of every rendered prompt.
pub const SYSTEM_PROMPT: &str = "You maintain a project by rewriting its desires document and \
proposing whole-file edits. Answer with a single JSON object matching the response contract. \
Do not add commentary outside the JSON.";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap()
});

/// Everything the template needs for one iteration.
#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub desires: &'a str,
    /// Last few ledger blocks, already cut by the ledger store.
    pub ledger_tail: &'a str,
    pub state: &'a StateSnapshot,
    pub context: &'a ContextBundle,
}

#[derive(Debug, Clone, Serialize)]
struct ContextItem<'a> {
    path: &'a str,
    available: bool,
    content: &'a str,
    truncated: bool,
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

/// Renders prompts within a byte budget.
///
/// When the rendered prompt is over budget, the ledger section goes first,
/// then context files from last to first. Required sections are never cut.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
    context_file_limit_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize, context_file_limit_bytes: usize) -> Self {
        Self {
            budget_bytes,
            context_file_limit_bytes,
        }
    }

    pub fn build(&self, input: &PromptInputs<'_>) -> Result<String> {
        let rendered = self.render(input)?;
        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(join_sections(&sections))
    }

    fn render(&self, input: &PromptInputs<'_>) -> Result<String> {
        let mut env = Environment::new();
        env.add_template("evolve", EVOLVE_TEMPLATE)
            .context("load prompt template")?;
        let template = env.get_template("evolve")?;

        let state = serde_json::to_string_pretty(input.state).context("serialize state")?;
        let context_items: Vec<ContextItem<'_>> = input
            .context
            .entries()
            .iter()
            .map(|entry| match &entry.content {
                ContextContent::Available(text) => {
                    let (content, truncated) =
                        truncate_at_boundary(text, self.context_file_limit_bytes);
                    ContextItem {
                        path: &entry.requested,
                        available: true,
                        content,
                        truncated,
                    }
                }
                ContextContent::Unavailable { .. } => ContextItem {
                    path: &entry.requested,
                    available: false,
                    content: "",
                    truncated: false,
                },
            })
            .collect();

        let ledger = input.ledger_tail.trim();
        let rendered = template
            .render(context! {
                desires => input.desires.trim_end(),
                state => state,
                ledger => (!ledger.is_empty()).then_some(ledger),
                context => context_items,
            })
            .context("render prompt template")?;
        Ok(rendered)
    }
}

fn truncate_at_boundary(text: &str, limit: usize) -> (&str, bool) {
    if text.len() <= limit {
        return (text, false);
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    (&text[..end], true)
}

/// Split rendered output on `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (i, caps) in markers.iter().enumerate() {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |next| next.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = &caps[2] == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: caps[1].to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn total_len(sections: &[Section]) -> usize {
    let separators = sections.len().saturating_sub(1) * 2;
    sections.iter().map(|s| s.content.len()).sum::<usize>() + separators
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    if let Some(idx) = sections
        .iter()
        .position(|s| s.key == "ledger" && !s.required)
        && total_len(sections) > budget
    {
        let dropped = sections.remove(idx);
        debug!(
            section = "ledger",
            bytes_dropped = dropped.content.len(),
            "dropped section for budget"
        );
    }

    while total_len(sections) > budget {
        let Some(idx) = sections
            .iter()
            .rposition(|s| s.key == "context" && !s.required)
        else {
            break;
        };
        let dropped = sections.remove(idx);
        debug!(
            section = "context",
            bytes_dropped = dropped.content.len(),
            "dropped section for budget"
        );
    }
}

fn join_sections(sections: &[Section]) -> String {
    let mut out = sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    out.push('\n');
    out
}
