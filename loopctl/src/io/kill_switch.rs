//! Kill switch markers.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::io::paths::SessionPaths;

/// First kill switch marker present, if any (project marker wins).
pub fn active_kill_switch(paths: &SessionPaths) -> Option<PathBuf> {
    find_marker(&paths.kill_switch_paths())
}

fn find_marker(candidates: &[&Path]) -> Option<PathBuf> {
    let found = candidates.iter().find(|path| path.exists())?;
    info!(marker = %found.display(), "kill switch present");
    Some(found.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn no_marker_means_inactive() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = SessionPaths::new(temp.path(), "s", &temp.path().join("state")).expect("paths");
        assert!(active_kill_switch(&paths).is_none());
    }

    #[test]
    fn project_marker_is_detected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = SessionPaths::new(temp.path(), "s", &temp.path().join("state")).expect("paths");
        fs::create_dir_all(&paths.controller_dir).expect("mkdir");
        fs::write(&paths.project_kill_switch_path, "").expect("touch");
        assert_eq!(
            active_kill_switch(&paths),
            Some(paths.project_kill_switch_path.clone())
        );
    }

    #[test]
    fn global_marker_is_detected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = SessionPaths::new(temp.path(), "s", &temp.path().join("state")).expect("paths");
        fs::create_dir_all(&paths.state_dir).expect("mkdir");
        fs::write(&paths.global_kill_switch_path, "").expect("touch");
        assert_eq!(
            active_kill_switch(&paths),
            Some(paths.global_kill_switch_path.clone())
        );
    }
}
