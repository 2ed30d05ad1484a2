//! Continuation prompt rendering.
//!
//! Templates are keyed by mode, with `exploration.<adapter>` preferred over
//! plain `exploration`. A project may override any key with
//! `.loopctl/templates/<key>.md`. Rendering never fails from the caller's point
//! of view: any template error falls back to a fixed prompt.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use minijinja::Environment;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::types::{CheckResult, CheckStatus, LoopMode, MetricsEntry};

const IMPLEMENTATION_TEMPLATE: &str = include_str!("prompts/implementation.md");
const VALIDATION_TEMPLATE: &str = include_str!("prompts/validation.md");
const EXPLORATION_TEMPLATE: &str = include_str!("prompts/exploration.md");
const EXPLORATION_EXPERIMENTS_TEMPLATE: &str = include_str!("prompts/exploration_experiments.md");

/// Prompt used when no template can be rendered.
pub const FALLBACK_PROMPT: &str = "Continue working on the task. Re-read the task artifact, \
make concrete progress on the next open item, and verify your changes before stopping.";

/// Rendered prompts are trimmed to roughly this many bytes.
pub const DEFAULT_PROMPT_BUDGET_BYTES: usize = 16_000;

/// Rows of the metrics table shown in experiment prompts.
const METRICS_ROWS: usize = 10;

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section regex is valid")
});

/// One row of the metrics table.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsRow {
    pub identifier: String,
    pub primary_metric: String,
    pub timestamp: String,
}

impl MetricsRow {
    /// Most recent `METRICS_ROWS` entries, oldest first.
    pub fn recent(history: &[MetricsEntry]) -> Vec<Self> {
        let start = history.len().saturating_sub(METRICS_ROWS);
        history[start..]
            .iter()
            .map(|entry| Self {
                identifier: entry.identifier.clone(),
                primary_metric: format!("{:.4}", entry.primary_metric),
                timestamp: entry.timestamp.format("%Y-%m-%d %H:%M").to_string(),
            })
            .collect()
    }
}

/// One line of the validation check summary.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CheckLine {
    pub name: String,
    pub outcome: String,
}

impl CheckLine {
    pub fn from_result(check: &CheckResult) -> Self {
        let outcome = match &check.status {
            CheckStatus::Completed { pass_rate } => format!("{:.0}% passed", pass_rate * 100.0),
            CheckStatus::TimedOut => "timed out".to_string(),
            CheckStatus::Errored { message } => format!("could not run ({message})"),
        };
        Self {
            name: check.name.clone(),
            outcome,
        }
    }
}

/// Everything a template can reference.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PromptContext {
    pub mode: LoopMode,
    pub iteration: u32,
    pub validation_round: u8,
    pub adapter: String,
    pub session_mode: String,
    pub reason: String,
    pub artifact: Option<String>,
    pub backoff_seconds: u64,
    pub open_items: Vec<String>,
    pub findings: Vec<String>,
    pub validation_score: Option<String>,
    pub checks: Vec<CheckLine>,
    pub opportunities: Vec<String>,
    pub metrics: Vec<MetricsRow>,
    pub forbidden: Vec<String>,
    pub encouraged: Vec<String>,
}

/// Template keys to try for `mode`, most specific first.
pub fn template_keys(mode: LoopMode, adapter: &str) -> Vec<String> {
    match mode {
        LoopMode::Validation => vec!["validation".to_string()],
        LoopMode::Exploration => vec![format!("exploration.{adapter}"), "exploration".to_string()],
        LoopMode::Implementation | LoopMode::Terminated => vec!["implementation".to_string()],
    }
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        for (name, source) in [
            ("implementation", IMPLEMENTATION_TEMPLATE),
            ("validation", VALIDATION_TEMPLATE),
            ("exploration", EXPLORATION_TEMPLATE),
            ("exploration.experiments", EXPLORATION_EXPERIMENTS_TEMPLATE),
        ] {
            env.add_template(name, source)
                .expect("embedded prompt template should be valid");
        }
        Self { env }
    }

    fn has_template(&self, key: &str) -> bool {
        self.env.get_template(key).is_ok()
    }

    fn render_embedded(&self, key: &str, ctx: &PromptContext) -> Result<String> {
        let template = self.env.get_template(key)?;
        Ok(template.render(ctx)?)
    }

    fn render_source(&self, source: &str, ctx: &PromptContext) -> Result<String> {
        Ok(self.env.render_str(source, ctx)?)
    }
}

/// Render the continuation prompt, falling back to [`FALLBACK_PROMPT`] on any error.
pub fn render_prompt(
    templates_dir: Option<&Path>,
    ctx: &PromptContext,
    budget_bytes: usize,
) -> String {
    match try_render(templates_dir, ctx) {
        Ok(rendered) => {
            let mut sections = parse_sections(&rendered);
            if sections.is_empty() {
                // Overrides without markers are used verbatim.
                return truncate_to(rendered.trim().to_string(), budget_bytes);
            }
            apply_budget_to_sections(&mut sections, budget_bytes);
            render_sections(&sections)
        }
        Err(err) => {
            warn!(err = %format!("{err:#}"), "prompt rendering failed, using fallback");
            FALLBACK_PROMPT.to_string()
        }
    }
}

fn try_render(templates_dir: Option<&Path>, ctx: &PromptContext) -> Result<String> {
    let engine = PromptEngine::new();
    let keys = template_keys(ctx.mode, &ctx.adapter);

    for key in &keys {
        if let Some(dir) = templates_dir {
            let path = dir.join(format!("{key}.md"));
            if path.is_file() {
                match fs::read_to_string(&path)
                    .map_err(anyhow::Error::from)
                    .and_then(|source| engine.render_source(&source, ctx))
                {
                    Ok(rendered) => {
                        debug!(template = %path.display(), "rendered override template");
                        return Ok(rendered);
                    }
                    Err(err) => warn!(
                        template = %path.display(),
                        err = %format!("{err:#}"),
                        "override template failed, trying next"
                    ),
                }
            }
        }
        if engine.has_template(key) {
            debug!(template = %key, "rendering embedded template");
            return engine.render_embedded(key, ctx);
        }
    }
    Err(anyhow!("no template for keys {}", keys.join(", ")))
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    /// Required sections are never dropped.
    required: bool,
    content: String,
}

/// Split rendered output on `<!-- section:KEY required|droppable -->` markers.
///
/// Empty droppable sections are discarded.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<(usize, usize, String, bool)> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let key = caps.get(1)?.as_str().to_string();
            let required = caps.get(2)?.as_str() == "required";
            Some((whole.start(), whole.end(), key, required))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (_, start, key, required)) in markers.iter().enumerate() {
        let end = markers
            .get(i + 1)
            .map(|(next_start, ..)| *next_start)
            .unwrap_or(rendered.len());
        let content = rendered[*start..end].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

/// Drop droppable sections until the prompt fits, then truncate the last one.
///
/// Drop order: opportunities -> metrics -> guidance -> backoff -> findings.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len =
        |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    if total_len(sections) <= budget {
        return;
    }

    for key in ["opportunities", "metrics", "guidance", "backoff", "findings"] {
        if total_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    if total_len(sections) > budget
        && let Some((last, rest)) = sections.split_last_mut()
    {
        let other_len: usize = rest.iter().map(|s| s.content.len()).sum();
        let allowed = budget.saturating_sub(other_len);
        let before_len = last.content.len();
        last.content = truncate_to(std::mem::take(&mut last.content), allowed);
        debug!(
            section = last.key,
            before_len,
            after_len = last.content.len(),
            "truncated section for budget"
        );
    }
}

fn truncate_to(mut text: String, allowed: usize) -> String {
    if text.len() <= allowed {
        return text;
    }
    const MARKER: &str = "\n[truncated]";
    let mut cut = allowed.saturating_sub(MARKER.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    if allowed > MARKER.len() {
        text.push_str(MARKER);
    }
    text
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
