//! Experiment-driven sessions: convergence from a metrics log.
//!
//! The project appends one JSON object per experiment to the metrics log
//! (default `.loopctl/metrics.jsonl`). The adapter stops the loop when the
//! experiment budget is spent (hard) and suggests stopping on a plateau.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::adapters::DomainAdapter;
use crate::core::types::{ConvergenceResult, MetricsEntry};

const PLATEAU_CONFIDENCE: f64 = 0.5;
const BUDGET_CONFIDENCE: f64 = 1.0;

/// Which way the primary metric improves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MetricDirection {
    #[default]
    Maximize,
    Minimize,
}

/// `[adapters.experiments]` settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExperimentsConfig {
    /// Metrics log, relative to the project directory.
    pub metrics_path: PathBuf,
    /// Experiment budget; 0 disables it.
    pub max_experiments: usize,
    /// Recent experiments compared against the best earlier result.
    pub plateau_window: usize,
    /// Minimum relative improvement over the window that counts as progress.
    pub min_improvement: f64,
    pub direction: MetricDirection,
}

impl Default for ExperimentsConfig {
    fn default() -> Self {
        Self {
            metrics_path: PathBuf::from(".loopctl/metrics.jsonl"),
            max_experiments: 50,
            plateau_window: 5,
            min_improvement: 0.01,
            direction: MetricDirection::Maximize,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExperimentsAdapter {
    cfg: ExperimentsConfig,
}

impl ExperimentsAdapter {
    pub fn new(cfg: ExperimentsConfig) -> Self {
        Self { cfg }
    }

    fn metrics_file(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.cfg.metrics_path)
    }

    /// Best metric in `entries` according to the configured direction.
    fn best(&self, entries: &[MetricsEntry]) -> Option<f64> {
        let values = entries
            .iter()
            .map(|e| e.primary_metric)
            .filter(|v| v.is_finite());
        match self.cfg.direction {
            MetricDirection::Maximize => values.reduce(f64::max),
            MetricDirection::Minimize => values.reduce(f64::min),
        }
    }

    /// Relative improvement of `recent` over `baseline` (positive is better).
    fn improvement(&self, baseline: f64, recent: f64) -> f64 {
        let delta = match self.cfg.direction {
            MetricDirection::Maximize => recent - baseline,
            MetricDirection::Minimize => baseline - recent,
        };
        let scale = baseline.abs();
        if scale < f64::EPSILON {
            return delta;
        }
        delta / scale
    }
}

impl DomainAdapter for ExperimentsAdapter {
    fn name(&self) -> &str {
        "experiments"
    }

    fn session_mode(&self) -> &str {
        "research"
    }

    fn detect(&self, project_dir: &Path) -> Result<bool> {
        Ok(self.metrics_file(project_dir).is_file())
    }

    fn metrics_history(&self, project_dir: &Path) -> Result<Vec<MetricsEntry>> {
        let path = self.metrics_file(project_dir);
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read metrics {}", path.display()))?;
        Ok(parse_metrics_log(&contents, &path))
    }

    fn check_convergence(&self, history: &[MetricsEntry]) -> Result<ConvergenceResult> {
        let count = history.len();
        if self.cfg.max_experiments > 0 && count >= self.cfg.max_experiments {
            return Ok(ConvergenceResult {
                should_continue: false,
                reason: format!(
                    "experiment budget reached ({count} >= {})",
                    self.cfg.max_experiments
                ),
                confidence: BUDGET_CONFIDENCE,
            });
        }

        let window = self.cfg.plateau_window;
        if window == 0 || count <= window {
            return Ok(ConvergenceResult::no_opinion(format!(
                "{count} experiments recorded"
            )));
        }
        let (earlier, recent) = history.split_at(count - window);
        let (Some(baseline), Some(best_recent)) = (self.best(earlier), self.best(recent)) else {
            return Ok(ConvergenceResult::no_opinion("no finite metrics yet"));
        };
        let gain = self.improvement(baseline, best_recent);
        debug!(baseline, best_recent, gain, "plateau check");
        if gain < self.cfg.min_improvement {
            return Ok(ConvergenceResult {
                should_continue: false,
                reason: format!(
                    "metric plateau: {:.2}% improvement over the last {window} experiments",
                    gain * 100.0
                ),
                confidence: PLATEAU_CONFIDENCE,
            });
        }
        Ok(ConvergenceResult::no_opinion(format!(
            "metric still improving ({:.2}%)",
            gain * 100.0
        )))
    }
}

/// Parse a JSONL metrics log, skipping malformed lines.
pub fn parse_metrics_log(contents: &str, path: &Path) -> Vec<MetricsEntry> {
    let mut entries = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<MetricsEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(err) => warn!(
                path = %path.display(),
                line = idx + 1,
                err = %err,
                "skipping malformed metrics line"
            ),
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn history(values: &[f64]) -> Vec<MetricsEntry> {
        let start = Utc::now();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| MetricsEntry {
                timestamp: start + Duration::minutes(i as i64),
                identifier: format!("exp-{i}"),
                primary_metric: *v,
                secondary_metrics: Default::default(),
            })
            .collect()
    }

    fn adapter(max_experiments: usize) -> ExperimentsAdapter {
        ExperimentsAdapter::new(ExperimentsConfig {
            max_experiments,
            plateau_window: 3,
            ..ExperimentsConfig::default()
        })
    }

    #[test]
    fn budget_is_a_hard_stop() {
        let result = adapter(4)
            .check_convergence(&history(&[1.0, 2.0, 3.0, 4.0]))
            .expect("convergence");
        assert!(!result.should_continue);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn plateau_is_a_suggestion() {
        let result = adapter(0)
            .check_convergence(&history(&[0.5, 0.9, 0.9, 0.901, 0.9]))
            .expect("convergence");
        assert!(!result.should_continue);
        assert_eq!(result.confidence, 0.5);
    }

    #[test]
    fn improving_metrics_have_no_opinion() {
        let result = adapter(0)
            .check_convergence(&history(&[0.5, 0.6, 0.7, 0.8, 0.9]))
            .expect("convergence");
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn minimize_direction_inverts_improvement() {
        let adapter = ExperimentsAdapter::new(ExperimentsConfig {
            max_experiments: 0,
            plateau_window: 2,
            direction: MetricDirection::Minimize,
            ..ExperimentsConfig::default()
        });
        let improving = adapter
            .check_convergence(&history(&[10.0, 8.0, 6.0]))
            .expect("convergence");
        assert_eq!(improving.confidence, 0.0);
        let stuck = adapter
            .check_convergence(&history(&[5.0, 6.0, 7.0]))
            .expect("convergence");
        assert_eq!(stuck.confidence, 0.5);
    }

    #[test]
    fn short_history_has_no_opinion() {
        let result = adapter(0)
            .check_convergence(&history(&[0.1, 0.1]))
            .expect("convergence");
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn detects_and_reads_metrics_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let adapter = adapter(0);
        assert!(!adapter.detect(temp.path()).expect("detect"));

        let dir = temp.path().join(".loopctl");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(
            dir.join("metrics.jsonl"),
            concat!(
                r#"{"timestamp":"2026-01-01T00:00:00Z","identifier":"a","primary_metric":0.4}"#,
                "\n",
                "garbage\n",
                r#"{"timestamp":"2026-01-01T01:00:00Z","identifier":"b","primary_metric":0.6,"secondary_metrics":{"loss":1.5}}"#,
                "\n",
            ),
        )
        .expect("write");

        assert!(adapter.detect(temp.path()).expect("detect"));
        let entries = adapter.metrics_history(temp.path()).expect("history");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].secondary_metrics.get("loss"), Some(&1.5));
    }
}
