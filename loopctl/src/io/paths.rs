//! Canonical paths for a controller session.
//!
//! State files live outside the project so that git worktrees sharing a session
//! id never collide: the key combines a hash of the canonical project path with
//! the session id.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use sha2::{Digest, Sha256};

use crate::core::classifier::CONTROLLER_DIR;

const PROJECT_HASH_LEN: usize = 16;
const SESSION_HASH_LEN: usize = 8;

/// All paths a single invocation touches.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub project_dir: PathBuf,
    pub project_hash: String,
    pub session_id: String,
    pub controller_dir: PathBuf,
    pub project_config_path: PathBuf,
    pub project_kill_switch_path: PathBuf,
    pub templates_dir: PathBuf,
    pub state_dir: PathBuf,
    pub global_kill_switch_path: PathBuf,
    pub state_path: PathBuf,
    pub journal_path: PathBuf,
}

impl SessionPaths {
    pub fn new(project_dir: &Path, session_id: &str, state_dir: &Path) -> Result<Self> {
        if session_id.trim().is_empty() {
            return Err(anyhow!("session id must not be empty"));
        }
        let project_dir = canonical_project_dir(project_dir);
        let project_hash = project_path_hash(&project_dir);
        let key = format!("{project_hash}-{}", session_key(session_id));
        let controller_dir = project_dir.join(CONTROLLER_DIR);
        Ok(Self {
            project_config_path: controller_dir.join("config.toml"),
            project_kill_switch_path: controller_dir.join("STOP"),
            templates_dir: controller_dir.join("templates"),
            controller_dir,
            global_kill_switch_path: state_dir.join("STOP"),
            state_path: state_dir.join(format!("{key}.json")),
            journal_path: state_dir.join(format!("{key}.events.jsonl")),
            state_dir: state_dir.to_path_buf(),
            project_dir,
            project_hash,
            session_id: session_id.to_string(),
        })
    }

    /// Kill switch marker locations, project first.
    pub fn kill_switch_paths(&self) -> [&Path; 2] {
        [
            self.project_kill_switch_path.as_path(),
            self.global_kill_switch_path.as_path(),
        ]
    }
}

/// Canonicalize when possible; fall back to the path as given.
pub fn canonical_project_dir(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// First 16 hex chars of SHA-256 over the canonical project path.
pub fn project_path_hash(canonical: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..PROJECT_HASH_LEN].to_string()
}

/// Replace anything outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_session_id(id: &str) -> String {
    id.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// File-name-safe key for a session id.
///
/// Ids that sanitizing would change get a short hash of the raw id appended, so
/// `a b` and `a_b` never share a state file.
pub fn session_key(id: &str) -> String {
    let sanitized = sanitize_session_id(id);
    if sanitized == id {
        return sanitized;
    }
    let digest = hex::encode(Sha256::digest(id.as_bytes()));
    format!("{sanitized}-{}", &digest[..SESSION_HASH_LEN])
}

/// Default state directory: platform state dir (or local data dir) + `loopctl/sessions`.
pub fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("loopctl")
        .join("sessions")
}

/// Default global config path: platform config dir + `loopctl/config.toml`.
pub fn default_global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("loopctl").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_session_in_two_worktrees_gets_distinct_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let a = temp.path().join("wt-a");
        let b = temp.path().join("wt-b");
        fs::create_dir_all(&a).expect("mkdir a");
        fs::create_dir_all(&b).expect("mkdir b");
        let state = temp.path().join("state");

        let pa = SessionPaths::new(&a, "sess-1", &state).expect("paths a");
        let pb = SessionPaths::new(&b, "sess-1", &state).expect("paths b");
        assert_ne!(pa.project_hash, pb.project_hash);
        assert_ne!(pa.state_path, pb.state_path);
    }

    #[test]
    fn hash_is_stable_for_equivalent_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dotted = temp.path().join(".");
        let state = temp.path().join("state");
        let a = SessionPaths::new(temp.path(), "s", &state).expect("paths");
        let b = SessionPaths::new(&dotted, "s", &state).expect("paths");
        assert_eq!(a.project_hash, b.project_hash);
        assert_eq!(a.project_hash.len(), 16);
    }

    #[test]
    fn session_ids_are_sanitized_for_file_names() {
        assert_eq!(sanitize_session_id("abc/../x y"), "abc_.._x_y");
        assert_eq!(sanitize_session_id("  ok-1.2_3 "), "ok-1.2_3");
    }

    #[test]
    fn ids_that_sanitize_alike_get_distinct_keys() {
        assert_eq!(session_key("a_b"), "a_b");
        let keys = ["a_b", "a b", "a/b", "a:b"].map(session_key);
        for (i, key) in keys.iter().enumerate() {
            assert!(key.starts_with("a_b"));
            for other in &keys[i + 1..] {
                assert_ne!(key, other);
            }
        }

        let temp = tempfile::tempdir().expect("tempdir");
        let state = temp.path().join("state");
        let spaced = SessionPaths::new(temp.path(), "a b", &state).expect("paths");
        let plain = SessionPaths::new(temp.path(), "a_b", &state).expect("paths");
        assert_ne!(spaced.state_path, plain.state_path);
        assert_eq!(spaced.session_id, "a b");
    }

    #[test]
    fn empty_session_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(SessionPaths::new(temp.path(), "  ", temp.path()).is_err());
    }
}
