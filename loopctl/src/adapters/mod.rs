//! Domain adapters: optional, project-specific convergence opinions.
//!
//! Adapters are consulted in registration order; the first whose `detect`
//! returns true is used. The universal adapter is always registered last, so
//! selection never comes back empty. An adapter that errors or panics is
//! replaced by the universal adapter for the rest of the invocation.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;

use anyhow::Result;
use tracing::{debug, warn};

use crate::core::types::{ConvergenceResult, MetricsEntry};
use crate::io::config::ControllerConfig;

pub mod experiments;
pub mod universal;

use experiments::ExperimentsAdapter;
use universal::UniversalAdapter;

pub trait DomainAdapter: Send + Sync {
    /// Registry name, also used to pick `exploration.<name>` prompt templates.
    fn name(&self) -> &str;
    /// Label for the kind of session this adapter drives (e.g. `research`).
    fn session_mode(&self) -> &str;
    fn detect(&self, project_dir: &Path) -> Result<bool>;
    /// Full metrics history for the project, oldest first.
    fn metrics_history(&self, project_dir: &Path) -> Result<Vec<MetricsEntry>>;
    fn check_convergence(&self, history: &[MetricsEntry]) -> Result<ConvergenceResult>;
}

/// Ordered adapter list with a guaranteed fallback.
pub struct AdapterRegistry {
    adapters: Vec<Box<dyn DomainAdapter>>,
    fallback: UniversalAdapter,
}

impl AdapterRegistry {
    /// Registry with only the universal fallback.
    pub fn new() -> Self {
        Self {
            adapters: Vec::new(),
            fallback: UniversalAdapter,
        }
    }

    /// Built-in adapters configured from `cfg`.
    pub fn from_config(cfg: &ControllerConfig) -> Self {
        Self::new().with_adapter(ExperimentsAdapter::new(cfg.adapters.experiments.clone()))
    }

    pub fn with_adapter(mut self, adapter: impl DomainAdapter + 'static) -> Self {
        self.adapters.push(Box::new(adapter));
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.adapters
            .iter()
            .map(|a| a.name())
            .chain(std::iter::once(self.fallback.name()))
            .collect()
    }

    /// First adapter that detects the project; the universal adapter otherwise.
    ///
    /// A detection error or panic ends the search with the universal adapter.
    pub fn select(&self, project_dir: &Path) -> &dyn DomainAdapter {
        for adapter in &self.adapters {
            let detected = catch_unwind(AssertUnwindSafe(|| adapter.detect(project_dir)));
            match detected {
                Ok(Ok(true)) => {
                    debug!(adapter = adapter.name(), "adapter selected");
                    return adapter.as_ref();
                }
                Ok(Ok(false)) => {}
                Ok(Err(err)) => {
                    warn!(
                        adapter = adapter.name(),
                        err = %format!("{err:#}"),
                        "adapter detection failed, using fallback"
                    );
                    return &self.fallback;
                }
                Err(_) => {
                    warn!(adapter = adapter.name(), "adapter detection panicked, using fallback");
                    return &self.fallback;
                }
            }
        }
        &self.fallback
    }

    /// The universal adapter.
    pub fn fallback(&self) -> &dyn DomainAdapter {
        &self.fallback
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapter opinion with confidence clamped to `[0, 1]`. `None` when the adapter errors or panics.
pub fn guarded_convergence(
    adapter: &dyn DomainAdapter,
    history: &[MetricsEntry],
) -> Option<ConvergenceResult> {
    match catch_unwind(AssertUnwindSafe(|| adapter.check_convergence(history))) {
        Ok(Ok(mut result)) => {
            if result.confidence.is_nan() {
                result.confidence = 0.0;
            }
            result.confidence = result.confidence.clamp(0.0, 1.0);
            Some(result)
        }
        Ok(Err(err)) => {
            warn!(
                adapter = adapter.name(),
                err = %format!("{err:#}"),
                "convergence check failed"
            );
            None
        }
        Err(_) => {
            warn!(adapter = adapter.name(), "convergence check panicked");
            None
        }
    }
}

/// Metrics history, or `None` when the adapter errors or panics.
pub fn guarded_metrics(
    adapter: &dyn DomainAdapter,
    project_dir: &Path,
) -> Option<Vec<MetricsEntry>> {
    match catch_unwind(AssertUnwindSafe(|| adapter.metrics_history(project_dir))) {
        Ok(Ok(history)) => Some(history),
        Ok(Err(err)) => {
            warn!(
                adapter = adapter.name(),
                err = %format!("{err:#}"),
                "metrics history unavailable"
            );
            None
        }
        Err(_) => {
            warn!(adapter = adapter.name(), "metrics history panicked");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    struct Broken;

    impl DomainAdapter for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn session_mode(&self) -> &str {
            "broken"
        }
        fn detect(&self, _project_dir: &Path) -> Result<bool> {
            Ok(true)
        }
        fn metrics_history(&self, _project_dir: &Path) -> Result<Vec<MetricsEntry>> {
            Err(anyhow!("no metrics"))
        }
        fn check_convergence(&self, _history: &[MetricsEntry]) -> Result<ConvergenceResult> {
            panic!("adapter bug")
        }
    }

    struct Shy;

    impl DomainAdapter for Shy {
        fn name(&self) -> &str {
            "shy"
        }
        fn session_mode(&self) -> &str {
            "shy"
        }
        fn detect(&self, _project_dir: &Path) -> Result<bool> {
            Err(anyhow!("cannot tell"))
        }
        fn metrics_history(&self, _project_dir: &Path) -> Result<Vec<MetricsEntry>> {
            Ok(Vec::new())
        }
        fn check_convergence(&self, _history: &[MetricsEntry]) -> Result<ConvergenceResult> {
            Ok(ConvergenceResult {
                should_continue: false,
                reason: "shy".to_string(),
                confidence: 7.0,
            })
        }
    }

    #[test]
    fn empty_registry_selects_universal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = AdapterRegistry::new();
        assert_eq!(registry.select(temp.path()).name(), "universal");
    }

    struct Quiet;

    impl DomainAdapter for Quiet {
        fn name(&self) -> &str {
            "quiet"
        }
        fn session_mode(&self) -> &str {
            "quiet"
        }
        fn detect(&self, _project_dir: &Path) -> Result<bool> {
            Ok(false)
        }
        fn metrics_history(&self, _project_dir: &Path) -> Result<Vec<MetricsEntry>> {
            Ok(Vec::new())
        }
        fn check_convergence(&self, _history: &[MetricsEntry]) -> Result<ConvergenceResult> {
            Ok(ConvergenceResult::no_opinion("quiet"))
        }
    }

    #[test]
    fn undetected_adapters_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = AdapterRegistry::new().with_adapter(Quiet).with_adapter(Broken);
        assert_eq!(registry.select(temp.path()).name(), "broken");
    }

    #[test]
    fn detection_error_selects_the_fallback() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = AdapterRegistry::new().with_adapter(Shy).with_adapter(Broken);
        assert_eq!(registry.select(temp.path()).name(), "universal");
        assert_eq!(registry.names(), vec!["shy", "broken", "universal"]);
    }

    #[test]
    fn panicking_adapter_reports_failure() {
        assert!(guarded_convergence(&Broken, &[]).is_none());
    }

    #[test]
    fn failing_metrics_report_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(guarded_metrics(&Broken, temp.path()).is_none());
    }

    #[test]
    fn confidence_is_clamped() {
        let result = guarded_convergence(&Shy, &[]).expect("opinion");
        assert_eq!(result.confidence, 1.0);
    }
}
