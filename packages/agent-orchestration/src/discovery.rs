use crate::config::DiscoveryConfig;
use crate::error::{OrchestratorError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

fn keep_entry(entry: &DirEntry, config: &DiscoveryConfig) -> bool {
    // The root itself is always walked
    if entry.depth() == 0 {
        return true;
    }
    if !config.include_hidden && is_hidden(entry) {
        return false;
    }
    if entry.file_type().is_dir() {
        let name = entry.file_name().to_string_lossy();
        return !config.exclude_dirs.iter().any(|d| d == name.as_ref());
    }
    true
}

fn extension_allowed(path: &Path, config: &DiscoveryConfig) -> bool {
    if config.extensions.is_empty() {
        return true;
    }
    path.extension()
        .map(|e| e.to_string_lossy())
        .is_some_and(|ext| {
            config
                .extensions
                .iter()
                .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(&ext))
        })
}

/// Enumerate candidate files under `root`, sorted
///
/// Unreadable entries are skipped with a warning; a missing root is fatal.
pub fn collect_candidates(root: &Path, config: &DiscoveryConfig) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(OrchestratorError::config(format!(
            "workspace root {} is not a directory",
            root.display()
        )));
    }

    let mut walker = WalkDir::new(root).follow_links(config.follow_links);
    if let Some(depth) = config.max_depth {
        walker = walker.max_depth(depth);
    }

    let mut files = Vec::new();
    for entry in walker.into_iter().filter_entry(|e| keep_entry(e, config)) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                continue;
            }
        };
        if entry.file_type().is_file() && extension_allowed(entry.path(), config) {
            files.push(entry.into_path());
        }
    }

    files.sort();
    debug!(root = %root.display(), count = files.len(), "candidates collected");
    Ok(files)
}
