//! Deterministic classification of changed paths.

use std::path::{Component, Path};

/// Project-relative directory owned by the controller.
pub const CONTROLLER_DIR: &str = ".loopctl";

/// Keep only paths that count as real work.
///
/// Anything under `.loopctl/` is bookkeeping (config, markers, templates,
/// metrics) and never counts. New metrics are observed through ingestion instead.
pub fn work_paths<P: AsRef<Path>>(changed_paths: &[P]) -> Vec<&Path> {
    changed_paths
        .iter()
        .map(AsRef::as_ref)
        .filter(|path| !is_controller_path(path))
        .collect()
}

/// True if any changed path is outside `.loopctl/`.
pub fn has_real_work<P: AsRef<Path>>(changed_paths: &[P]) -> bool {
    !work_paths(changed_paths).is_empty()
}

fn is_controller_path(path: &Path) -> bool {
    let mut components = path
        .components()
        .filter(|component| !matches!(component, Component::CurDir | Component::RootDir));

    match components.next() {
        Some(Component::Normal(name)) => name == CONTROLLER_DIR,
        _ => false,
    }
}
