//! Controller configuration layered from a global and a project `config.toml`.
//!
//! Configuration errors never abort an invocation: unreadable layers are
//! skipped and invalid values are replaced with safe defaults.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::adapters::experiments::ExperimentsConfig;
use crate::core::completion::CompletionSettings;
use crate::core::gate::LoopLimits;
use crate::core::idle::DEFAULT_FORCE_AFTER;
use crate::core::similarity::{DEFAULT_THRESHOLD, DEFAULT_WINDOW};
use crate::core::validation::DEFAULT_PASS_THRESHOLD;
use crate::io::checks::CheckSpec;

/// Controller configuration (TOML).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ControllerConfig {
    /// Reduced-scale mode: short limits and short check timeouts.
    pub fast_mode: bool,
    /// Task artifact, relative to the project directory.
    pub artifact: Option<PathBuf>,
    pub limits: LimitsConfig,
    pub completion: CompletionSettings,
    pub idle: IdleConfig,
    pub loop_detection: LoopDetectionConfig,
    pub validation: ValidationConfig,
    pub guidance: Guidance,
    pub adapters: AdaptersConfig,
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    pub min_hours: f64,
    pub max_hours: f64,
    pub min_iterations: u32,
    pub max_iterations: u32,
    /// Limits applied instead when `fast_mode` is set.
    pub fast: FastLimits,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let base = LoopLimits::default();
        Self {
            min_hours: base.min_hours,
            max_hours: base.max_hours,
            min_iterations: base.min_iterations,
            max_iterations: base.max_iterations,
            fast: FastLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FastLimits {
    pub min_hours: f64,
    pub max_hours: f64,
    pub min_iterations: u32,
    pub max_iterations: u32,
}

impl Default for FastLimits {
    fn default() -> Self {
        Self {
            min_hours: 0.0,
            max_hours: 0.5,
            min_iterations: 0,
            max_iterations: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdleConfig {
    /// Consecutive idle IMPLEMENTATION iterations before EXPLORATION is forced.
    pub force_after: u32,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            force_after: DEFAULT_FORCE_AFTER,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopDetectionConfig {
    pub window: usize,
    pub threshold: f64,
}

impl Default for LoopDetectionConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidationConfig {
    pub pass_threshold: f64,
    pub timeout_secs: u64,
    pub fast_timeout_secs: u64,
    pub max_workers: usize,
    /// Truncate captured check output beyond this many bytes.
    pub output_limit_bytes: usize,
    pub checks: Vec<CheckSpec>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            pass_threshold: DEFAULT_PASS_THRESHOLD,
            timeout_secs: 120,
            fast_timeout_secs: 30,
            max_workers: 4,
            output_limit_bytes: 100_000,
            checks: Vec::new(),
        }
    }
}

/// Forbidden/encouraged phrases produced by an external discovery process.
///
/// Rendered into prompts verbatim; never interpreted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Guidance {
    pub forbidden: Vec<String>,
    pub encouraged: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AdaptersConfig {
    pub experiments: ExperimentsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub max_items: usize,
    pub max_files: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_items: 8,
            max_files: 2000,
        }
    }
}

impl ControllerConfig {
    /// Limits in effect for this configuration (fast mode swaps them).
    pub fn effective_limits(&self) -> LoopLimits {
        if self.fast_mode {
            let fast = &self.limits.fast;
            return LoopLimits {
                min_hours: fast.min_hours,
                max_hours: fast.max_hours,
                min_iterations: fast.min_iterations,
                max_iterations: fast.max_iterations,
                check_timeout_secs: self.validation.fast_timeout_secs,
            };
        }
        LoopLimits {
            min_hours: self.limits.min_hours,
            max_hours: self.limits.max_hours,
            min_iterations: self.limits.min_iterations,
            max_iterations: self.limits.max_iterations,
            check_timeout_secs: self.validation.timeout_secs,
        }
    }

    /// Replace invalid values with defaults. Returns one message per fix.
    pub fn sanitize(&mut self) -> Vec<String> {
        let mut fixes = Vec::new();
        let defaults = ControllerConfig::default();

        sanitize_limits(
            "limits",
            (&mut self.limits.min_hours, &mut self.limits.max_hours),
            (
                &mut self.limits.min_iterations,
                &mut self.limits.max_iterations,
            ),
            (defaults.limits.max_hours, defaults.limits.max_iterations),
            &mut fixes,
        );
        sanitize_limits(
            "limits.fast",
            (
                &mut self.limits.fast.min_hours,
                &mut self.limits.fast.max_hours,
            ),
            (
                &mut self.limits.fast.min_iterations,
                &mut self.limits.fast.max_iterations,
            ),
            (
                defaults.limits.fast.max_hours,
                defaults.limits.fast.max_iterations,
            ),
            &mut fixes,
        );

        if !unit_interval(self.completion.threshold) {
            fixes.push(format!(
                "completion.threshold {} outside (0, 1]",
                self.completion.threshold
            ));
            self.completion.threshold = defaults.completion.threshold;
        }

        let v = &mut self.validation;
        if !unit_interval(v.pass_threshold) {
            fixes.push(format!(
                "validation.pass_threshold {} outside (0, 1]",
                v.pass_threshold
            ));
            v.pass_threshold = defaults.validation.pass_threshold;
        }
        if v.timeout_secs == 0 {
            fixes.push("validation.timeout_secs must be > 0".to_string());
            v.timeout_secs = defaults.validation.timeout_secs;
        }
        if v.fast_timeout_secs == 0 {
            fixes.push("validation.fast_timeout_secs must be > 0".to_string());
            v.fast_timeout_secs = defaults.validation.fast_timeout_secs;
        }
        if v.max_workers == 0 {
            fixes.push("validation.max_workers must be > 0".to_string());
            v.max_workers = defaults.validation.max_workers;
        }
        if v.output_limit_bytes == 0 {
            fixes.push("validation.output_limit_bytes must be > 0".to_string());
            v.output_limit_bytes = defaults.validation.output_limit_bytes;
        }
        v.checks.retain(|check| match check.validate() {
            Ok(()) => true,
            Err(err) => {
                fixes.push(format!("dropped validation check: {err:#}"));
                false
            }
        });

        let ld = &mut self.loop_detection;
        if ld.window < 2 {
            fixes.push(format!("loop_detection.window {} must be >= 2", ld.window));
            ld.window = defaults.loop_detection.window;
        }
        if !unit_interval(ld.threshold) {
            fixes.push(format!(
                "loop_detection.threshold {} outside (0, 1]",
                ld.threshold
            ));
            ld.threshold = defaults.loop_detection.threshold;
        }

        fixes
    }
}

fn unit_interval(value: f64) -> bool {
    value > 0.0 && value <= 1.0
}

fn sanitize_limits(
    section: &str,
    (min_hours, max_hours): (&mut f64, &mut f64),
    (min_iter, max_iter): (&mut u32, &mut u32),
    (default_max_hours, default_max_iter): (f64, u32),
    fixes: &mut Vec<String>,
) {
    if !max_hours.is_finite() || *max_hours <= 0.0 {
        fixes.push(format!("{section}.max_hours {max_hours} must be > 0"));
        *max_hours = default_max_hours;
    }
    if !min_hours.is_finite() || *min_hours < 0.0 || *min_hours > *max_hours {
        fixes.push(format!(
            "{section}.min_hours {min_hours} must be within [0, max_hours]"
        ));
        *min_hours = 0.0;
    }
    if *max_iter == 0 {
        fixes.push(format!("{section}.max_iterations must be > 0"));
        *max_iter = default_max_iter;
    }
    if *min_iter > *max_iter {
        fixes.push(format!(
            "{section}.min_iterations {min_iter} exceeds max_iterations {max_iter}"
        ));
        *min_iter = 0;
    }
}

/// Load the global layer (optional) and the project layer, project values winning.
///
/// Never fails: broken layers are skipped with a warning and invalid values are
/// replaced with defaults.
pub fn load_layered_config(global: Option<&Path>, project: &Path) -> ControllerConfig {
    let global_table = global.and_then(|path| read_layer(path));
    let project_table = read_layer(project);

    let mut merged = toml::Table::new();
    if let Some(table) = &global_table {
        merge_tables(&mut merged, table.clone());
    }
    if let Some(table) = project_table {
        merge_tables(&mut merged, table);
    }

    let mut cfg = match toml::Value::Table(merged).try_into::<ControllerConfig>() {
        Ok(cfg) => cfg,
        Err(err) => {
            warn!(err = %err, "invalid merged config, retrying with global layer only");
            global_table
                .and_then(|table| toml::Value::Table(table).try_into().ok())
                .unwrap_or_default()
        }
    };

    for fix in cfg.sanitize() {
        warn!(fix = %fix, "config value replaced with default");
    }
    debug!(
        fast_mode = cfg.fast_mode,
        checks = cfg.validation.checks.len(),
        "config loaded"
    );
    cfg
}

fn read_layer(path: &Path) -> Option<toml::Table> {
    if !path.exists() {
        return None;
    }
    match parse_layer(path) {
        Ok(table) => Some(table),
        Err(err) => {
            warn!(path = %path.display(), err = %format!("{err:#}"), "skipping config layer");
            None
        }
    }
}

fn parse_layer(path: &Path) -> Result<toml::Table> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Deep-merge `overlay` into `base`; nested tables merge, everything else replaces.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
