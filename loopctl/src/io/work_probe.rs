//! Work fingerprinting.
//!
//! A fingerprint summarizes the observable project state: git HEAD, the
//! porcelain status of non-controller paths (with size and mtime so repeated
//! edits to an already-dirty file still register), and the task artifact's
//! content. Outside git a bounded directory walk stands in for the status.

use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use anyhow::Result;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::core::classifier::{CONTROLLER_DIR, has_real_work};
use crate::io::git::Git;

const SKIPPED_DIRS: [&str; 4] = [CONTROLLER_DIR, ".git", "target", "node_modules"];

/// Compute the fingerprint of `project_dir`.
pub fn fingerprint(
    project_dir: &Path,
    artifact: Option<&Path>,
    max_files: usize,
) -> Result<String> {
    let mut hasher = Sha256::new();
    let git = Git::new(project_dir);
    if git.is_work_tree() {
        hash_git_state(&git, &mut hasher)?;
    } else {
        hash_tree_walk(project_dir, max_files, &mut hasher);
    }

    if let Some(path) = artifact {
        hasher.update(b"artifact\0");
        match fs::read(path) {
            Ok(bytes) => hasher.update(Sha256::digest(&bytes)),
            Err(_) => hasher.update(b"missing"),
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// True when the state changed since `previous`. The first observation counts as work.
pub fn work_observed(previous: Option<&str>, current: &str) -> bool {
    previous.is_none_or(|prev| prev != current)
}

fn hash_git_state(git: &Git, hasher: &mut Sha256) -> Result<()> {
    let head = git.head_sha()?.unwrap_or_default();
    hasher.update(b"head\0");
    hasher.update(head.as_bytes());

    let entries = git.status_porcelain()?;
    let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
    if !has_real_work(&paths) {
        debug!(head = %head, "clean work tree outside controller dir");
        return Ok(());
    }
    for entry in entries
        .iter()
        .filter(|e| has_real_work(&[e.path.as_str()]))
    {
        hasher.update(entry.code.as_bytes());
        hasher.update(entry.path.as_bytes());
        hash_metadata(&git.workdir().join(&entry.path), hasher);
    }
    Ok(())
}

fn hash_tree_walk(project_dir: &Path, max_files: usize, hasher: &mut Sha256) {
    let walker = WalkDir::new(project_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| SKIPPED_DIRS.contains(&name))
        });
    let mut seen = 0usize;
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(err = %err, "skipping unreadable path");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        seen += 1;
        if seen > max_files {
            debug!(max_files, "file walk truncated");
            break;
        }
        let rel = entry.path().strip_prefix(project_dir).unwrap_or(entry.path());
        hasher.update(rel.to_string_lossy().as_bytes());
        hash_metadata(entry.path(), hasher);
    }
}

fn hash_metadata(path: &Path, hasher: &mut Sha256) {
    let Ok(meta) = fs::metadata(path) else {
        hasher.update(b"gone");
        return;
    };
    hasher.update(meta.len().to_le_bytes());
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    hasher.update(mtime.to_le_bytes());
}
