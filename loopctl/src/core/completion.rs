//! Completion detection over the active task artifact.
//!
//! Every signal carries a fixed weight; the overall confidence is the maximum
//! over detected signals, never their sum.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::types::{CompletionReport, CompletionSignal, SignalKind};

static STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)^\s*(?:[-*+]\s+)?[*_]{0,2}status[*_]{0,2}\s*:\s*[*_]{0,2}\s*["'`]?(complete|completed|done|finished)\b"#,
    )
    .expect("status regex is valid")
});

static TASK_BOX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+\[([ xX])\]\s*(.*)$").expect("task box regex is valid")
});

const CHECKED_SYMBOLS: [&str; 3] = ["✅", "✔", "☑"];
const UNCHECKED_SYMBOLS: [&str; 2] = ["☐", "⬜"];

/// Confidence weight per signal kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalWeights {
    pub explicit_marker: f64,
    pub status_field: f64,
    pub all_checked: f64,
    pub no_pending_items: f64,
    pub semantic_phrase: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            explicit_marker: 1.0,
            status_field: 0.95,
            all_checked: 0.9,
            no_pending_items: 0.85,
            semantic_phrase: 0.7,
        }
    }
}

impl SignalWeights {
    fn weight(&self, kind: SignalKind) -> f64 {
        let raw = match kind {
            SignalKind::ExplicitMarker => self.explicit_marker,
            SignalKind::StatusField => self.status_field,
            SignalKind::AllChecked => self.all_checked,
            SignalKind::NoPendingItems => self.no_pending_items,
            SignalKind::SemanticPhrase => self.semantic_phrase,
        };
        raw.clamp(0.0, 1.0)
    }
}

/// Per-project completion heuristics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionSettings {
    /// Confidence at or above which the artifact counts as complete.
    pub threshold: f64,
    pub markers: Vec<String>,
    pub phrases: Vec<String>,
    pub weights: SignalWeights,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            markers: vec!["TASK_COMPLETE".to_string(), "[LOOP COMPLETE]".to_string()],
            phrases: [
                "all tasks completed",
                "all tasks are complete",
                "task is complete",
                "implementation complete",
                "implementation is complete",
                "nothing left to do",
                "work is complete",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            weights: SignalWeights::default(),
        }
    }
}

#[derive(Debug, Default)]
struct ChecklistTally {
    checked: usize,
    unchecked: usize,
    first_checked_line: Option<usize>,
}

/// Scan artifact `text` (labelled `label` in source locations).
pub fn scan_artifact(label: &str, text: &str, settings: &CompletionSettings) -> CompletionReport {
    let mut signals: Vec<CompletionSignal> = Vec::new();
    let push = |kind: SignalKind, line: usize, signals: &mut Vec<CompletionSignal>| {
        if signals.iter().any(|s| s.kind == kind) {
            return;
        }
        signals.push(CompletionSignal {
            kind,
            confidence: settings.weights.weight(kind),
            source_location: format!("{label}:{line}"),
        });
    };

    let phrases: Vec<String> = settings
        .phrases
        .iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect();

    let mut boxes = ChecklistTally::default();
    let mut any = ChecklistTally::default();
    let mut open_item_texts = Vec::new();
    let mut in_fence = false;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }

        if settings
            .markers
            .iter()
            .any(|m| !m.is_empty() && line.contains(m.as_str()))
        {
            push(SignalKind::ExplicitMarker, line_no, &mut signals);
        }
        if STATUS_RE.is_match(line) {
            push(SignalKind::StatusField, line_no, &mut signals);
        }

        if let Some(caps) = TASK_BOX_RE.captures(line) {
            let checked = !caps[1].trim().is_empty();
            tally(&mut boxes, checked, line_no);
            tally(&mut any, checked, line_no);
            if !checked {
                open_item_texts.push(caps[2].trim().to_string());
            }
        } else if let Some((checked, rest)) = symbol_item(line) {
            tally(&mut any, checked, line_no);
            if !checked {
                open_item_texts.push(rest.to_string());
            }
        }

        let lowered = line.to_lowercase();
        if phrases.iter().any(|p| lowered.contains(p.as_str())) {
            push(SignalKind::SemanticPhrase, line_no, &mut signals);
        }
    }

    if boxes.checked > 0 && boxes.unchecked == 0 {
        push(
            SignalKind::AllChecked,
            boxes.first_checked_line.unwrap_or(1),
            &mut signals,
        );
    }
    if any.checked > 0 && any.unchecked == 0 {
        push(
            SignalKind::NoPendingItems,
            any.first_checked_line.unwrap_or(1),
            &mut signals,
        );
    }

    CompletionReport {
        confidence: reduce_confidence(&signals),
        signals,
        open_items: any.unchecked,
        open_item_texts,
    }
}

/// Overall confidence: maximum over signals, 0.0 without any.
pub fn reduce_confidence(signals: &[CompletionSignal]) -> f64 {
    signals
        .iter()
        .map(|s| s.confidence.clamp(0.0, 1.0))
        .fold(0.0, f64::max)
}

pub fn is_complete(report: &CompletionReport, settings: &CompletionSettings) -> bool {
    report.confidence >= settings.threshold
}

fn tally(t: &mut ChecklistTally, checked: bool, line_no: usize) {
    if checked {
        t.checked += 1;
        t.first_checked_line.get_or_insert(line_no);
    } else {
        t.unchecked += 1;
    }
}

fn symbol_item(line: &str) -> Option<(bool, &str)> {
    let mut rest = line.trim_start();
    for bullet in ["- ", "* ", "+ "] {
        if let Some(stripped) = rest.strip_prefix(bullet) {
            rest = stripped.trim_start();
            break;
        }
    }
    for sym in CHECKED_SYMBOLS {
        if let Some(tail) = rest.strip_prefix(sym) {
            return Some((true, tail.trim_start_matches('\u{fe0f}').trim()));
        }
    }
    for sym in UNCHECKED_SYMBOLS {
        if let Some(tail) = rest.strip_prefix(sym) {
            return Some((false, tail.trim_start_matches('\u{fe0f}').trim()));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(text: &str) -> CompletionReport {
        scan_artifact("TASK.md", text, &CompletionSettings::default())
    }

    fn kinds(report: &CompletionReport) -> Vec<SignalKind> {
        report.signals.iter().map(|s| s.kind).collect()
    }

    #[test]
    fn empty_artifact_has_zero_confidence() {
        let report = scan("# Plan\n\nSome notes without structure.\n");
        assert!(report.signals.is_empty());
        assert_eq!(report.confidence, 0.0);
    }

    #[test]
    fn explicit_marker_is_strongest() {
        let report = scan("- [ ] pending\nTASK_COMPLETE\n");
        assert_eq!(report.confidence, 1.0);
        assert_eq!(report.signals[0].source_location, "TASK.md:2");
    }

    #[test]
    fn status_field_variants_are_detected() {
        for text in [
            "---\nstatus: completed\n---\n",
            "**Status**: Done\n",
            "**Status:** Finished\n",
            "- status: complete\n",
        ] {
            let report = scan(text);
            assert_eq!(kinds(&report), vec![SignalKind::StatusField], "{text}");
            assert_eq!(report.confidence, 0.95);
        }
        assert!(scan("status: in progress\n").signals.is_empty());
    }

    #[test]
    fn all_checked_requires_at_least_one_item() {
        let report = scan("- [x] a\n- [X] b\n1. [x] c\n- [x] d\n- [x] e\n");
        assert!(kinds(&report).contains(&SignalKind::AllChecked));
        assert_eq!(report.confidence, 0.9);
        assert_eq!(report.open_items, 0);

        let no_items = scan("# Nothing here\n");
        assert!(!kinds(&no_items).contains(&SignalKind::AllChecked));
        assert!(!kinds(&no_items).contains(&SignalKind::NoPendingItems));
    }

    #[test]
    fn unchecked_item_blocks_checklist_tiers() {
        let report = scan("- [x] a\n- [ ] b\n");
        assert!(report.signals.is_empty());
        assert_eq!(report.open_items, 1);
        assert_eq!(report.open_item_texts, vec!["b".to_string()]);
    }

    #[test]
    fn symbol_checklist_yields_no_pending_tier() {
        let report = scan("- ✅ wire codec\n- ✔️ tests\n");
        assert_eq!(kinds(&report), vec![SignalKind::NoPendingItems]);
        assert_eq!(report.confidence, 0.85);

        let pending = scan("- ✅ wire codec\n- ☐ docs\n");
        assert!(pending.signals.is_empty());
        assert_eq!(pending.open_item_texts, vec!["docs".to_string()]);
    }

    #[test]
    fn semantic_phrase_is_case_insensitive() {
        let report = scan("Summary: All Tasks Completed for this sprint.\n");
        assert_eq!(kinds(&report), vec![SignalKind::SemanticPhrase]);
        assert_eq!(report.confidence, 0.7);
    }

    #[test]
    fn confidence_is_max_not_sum() {
        let report = scan("- [x] a\nall tasks completed\nstatus: done\n");
        assert!(report.signals.len() >= 3);
        assert_eq!(report.confidence, 0.95);
        assert!(report.confidence <= 1.0);
    }

    #[test]
    fn fenced_examples_are_ignored() {
        let report = scan("```\n- [x] example\nall tasks completed\n```\n- [ ] real\n");
        assert!(report.signals.is_empty());
        assert_eq!(report.open_items, 1);
    }

    #[test]
    fn scanning_is_idempotent() {
        let text = "- [x] a\n- [x] b\nimplementation complete\n";
        assert_eq!(scan(text), scan(text));
    }

    #[test]
    fn weights_are_configurable_and_clamped() {
        let settings = CompletionSettings {
            weights: SignalWeights {
                semantic_phrase: 1.7,
                ..SignalWeights::default()
            },
            ..CompletionSettings::default()
        };
        let report = scan_artifact("t", "work is complete\n", &settings);
        assert_eq!(report.confidence, 1.0);
    }

    #[test]
    fn threshold_decides_completion() {
        let settings = CompletionSettings::default();
        assert!(is_complete(&scan("- [x] a\n"), &settings));
        assert!(!is_complete(&scan("- [ ] a\n"), &settings));
    }
}
