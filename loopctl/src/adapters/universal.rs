//! Fallback adapter: applies to every project and never has an opinion.

use std::path::Path;

use anyhow::Result;

use crate::adapters::DomainAdapter;
use crate::core::types::{ConvergenceResult, MetricsEntry};

#[derive(Debug, Clone, Copy, Default)]
pub struct UniversalAdapter;

impl DomainAdapter for UniversalAdapter {
    fn name(&self) -> &str {
        "universal"
    }

    fn session_mode(&self) -> &str {
        "development"
    }

    fn detect(&self, _project_dir: &Path) -> Result<bool> {
        Ok(true)
    }

    fn metrics_history(&self, _project_dir: &Path) -> Result<Vec<MetricsEntry>> {
        Ok(Vec::new())
    }

    fn check_convergence(&self, _history: &[MetricsEntry]) -> Result<ConvergenceResult> {
        Ok(ConvergenceResult::no_opinion("no domain-specific signal"))
    }
}
