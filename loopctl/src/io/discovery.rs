//! Opportunity discovery for EXPLORATION prompts.
//!
//! Collects leftover validation findings, unchecked artifact items, and
//! TODO/FIXME/XXX markers in project files, in that order, up to a limit.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

const SKIPPED_DIRS: [&str; 2] = ["target", "node_modules"];
const MAX_FILE_BYTES: u64 = 256 * 1024;
const MAX_MARKER_TEXT: usize = 120;

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(TODO|FIXME|XXX)\b[:\s]*(.*)$").expect("marker regex is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityKind {
    Finding,
    OpenItem,
    Marker,
}

/// One candidate piece of follow-up work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Opportunity {
    pub kind: OpportunityKind,
    pub summary: String,
    /// `path:line` for markers.
    pub location: Option<String>,
}

impl Opportunity {
    /// One-line rendering used in prompts.
    pub fn describe(&self) -> String {
        match (self.kind, &self.location) {
            (OpportunityKind::Finding, _) => {
                format!("Unresolved validation finding: {}", self.summary)
            }
            (OpportunityKind::OpenItem, _) => format!("Unchecked task item: {}", self.summary),
            (OpportunityKind::Marker, Some(location)) => format!("{} ({location})", self.summary),
            (OpportunityKind::Marker, None) => self.summary.clone(),
        }
    }
}

/// Inputs for one discovery pass.
#[derive(Debug, Clone)]
pub struct DiscoveryInput<'a> {
    pub project_dir: &'a Path,
    pub open_items: &'a [String],
    pub findings: &'a [String],
    pub max_items: usize,
    pub max_files: usize,
}

/// Ranked improvement candidates, at most `max_items`.
pub fn discover_opportunities(input: &DiscoveryInput<'_>) -> Vec<Opportunity> {
    let mut out: Vec<Opportunity> = Vec::new();
    if input.max_items == 0 {
        return out;
    }

    let ranked = input
        .findings
        .iter()
        .map(|f| (OpportunityKind::Finding, f))
        .chain(input.open_items.iter().map(|i| (OpportunityKind::OpenItem, i)));
    for (kind, summary) in ranked {
        if out.len() >= input.max_items {
            return out;
        }
        out.push(Opportunity {
            kind,
            summary: summary.clone(),
            location: None,
        });
    }

    let remaining = input.max_items - out.len();
    out.extend(scan_markers(input.project_dir, input.max_files, remaining));
    debug!(found = out.len(), "discovery finished");
    out
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.') || SKIPPED_DIRS.contains(&name))
}

fn scan_markers(project_dir: &Path, max_files: usize, limit: usize) -> Vec<Opportunity> {
    let mut found = Vec::new();
    if limit == 0 {
        return found;
    }
    let walker = WalkDir::new(project_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_skipped_dir(entry));

    let mut files = 0usize;
    for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        files += 1;
        if files > max_files {
            break;
        }
        if entry.metadata().map(|m| m.len()).unwrap_or(u64::MAX) > MAX_FILE_BYTES {
            continue;
        }
        // Binary and non-UTF-8 files are skipped.
        let Ok(text) = fs::read_to_string(entry.path()) else {
            continue;
        };
        let rel = entry
            .path()
            .strip_prefix(project_dir)
            .unwrap_or(entry.path())
            .display()
            .to_string();
        for (idx, line) in text.lines().enumerate() {
            let Some(caps) = MARKER_RE.captures(line) else {
                continue;
            };
            let tag = caps.get(1).map_or("TODO", |m| m.as_str());
            let body: String = caps
                .get(2)
                .map_or("", |m| m.as_str())
                .trim()
                .trim_end_matches("*/")
                .trim()
                .chars()
                .take(MAX_MARKER_TEXT)
                .collect();
            found.push(Opportunity {
                kind: OpportunityKind::Marker,
                summary: if body.is_empty() {
                    tag.to_string()
                } else {
                    format!("{tag}: {body}")
                },
                location: Some(format!("{rel}:{}", idx + 1)),
            });
            if found.len() >= limit {
                return found;
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(
        dir: &'a Path,
        open: &'a [String],
        findings: &'a [String],
        max: usize,
    ) -> DiscoveryInput<'a> {
        DiscoveryInput {
            project_dir: dir,
            open_items: open,
            findings,
            max_items: max,
            max_files: 100,
        }
    }

    #[test]
    fn findings_rank_before_items_and_markers() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("lib.rs"),
            "fn a() {}\n// TODO: handle errors\n",
        )
        .expect("write");
        let open = vec!["docs".to_string()];
        let findings = vec!["[lint] unused".to_string()];

        let out: Vec<String> = discover_opportunities(&input(temp.path(), &open, &findings, 8))
            .iter()
            .map(Opportunity::describe)
            .collect();
        assert_eq!(
            out,
            vec![
                "Unresolved validation finding: [lint] unused".to_string(),
                "Unchecked task item: docs".to_string(),
                "TODO: handle errors (lib.rs:2)".to_string(),
            ]
        );
    }

    #[test]
    fn limit_is_respected() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("a.py"),
            "# FIXME one\n# XXX two\n# TODO three\n",
        )
        .expect("write");
        let out = discover_opportunities(&input(temp.path(), &[], &[], 2));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].kind, OpportunityKind::Marker);
        assert_eq!(out[0].summary, "FIXME: one");
        assert_eq!(out[0].location.as_deref(), Some("a.py:1"));
    }

    #[test]
    fn hidden_and_build_dirs_are_not_scanned() {
        let temp = tempfile::tempdir().expect("tempdir");
        for dir in [".loopctl", ".git", "target"] {
            fs::create_dir_all(temp.path().join(dir)).expect("mkdir");
            fs::write(temp.path().join(dir).join("notes.md"), "TODO hidden").expect("write");
        }
        assert!(discover_opportunities(&input(temp.path(), &[], &[], 8)).is_empty());
    }

    #[test]
    fn oversized_files_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut big = "x".repeat(MAX_FILE_BYTES as usize);
        big.push_str("\nTODO buried");
        fs::write(temp.path().join("big.txt"), big).expect("write");
        assert!(discover_opportunities(&input(temp.path(), &[], &[], 8)).is_empty());
    }

    #[test]
    fn zero_limit_disables_discovery() {
        let temp = tempfile::tempdir().expect("tempdir");
        let findings = vec!["x".to_string()];
        assert!(discover_opportunities(&input(temp.path(), &[], &findings, 0)).is_empty());
    }
}
