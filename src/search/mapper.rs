//! Indented directory listing of a repository, for prompts.

use std::path::Path;
use walkdir::{DirEntry, WalkDir};

/// Default listing depth.
pub const DEFAULT_MAP_DEPTH: usize = 3;

/// Directories never listed.
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", "dist", "build", "target"];

/// Entries past this are cut with a marker line.
const MAX_MAP_ENTRIES: usize = 500;

fn is_skipped(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && SKIPPED_DIRS
            .iter()
            .any(|skip| entry.file_name().to_string_lossy() == *skip)
}

/// List `repo` up to `max_depth` levels deep, two spaces per level,
/// directories suffixed with `/`. Unreadable entries are skipped.
#[must_use]
pub fn project_map(repo: &Path, max_depth: usize) -> String {
    let mut lines = Vec::new();
    let walker = WalkDir::new(repo)
        .min_depth(1)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_skipped(e));

    for entry in walker.filter_map(std::result::Result::ok) {
        if lines.len() >= MAX_MAP_ENTRIES {
            lines.push("...".to_string());
            break;
        }
        let indent = "  ".repeat(entry.depth() - 1);
        let name = entry.file_name().to_string_lossy();
        if entry.file_type().is_dir() {
            lines.push(format!("{}{}/", indent, name));
        } else {
            lines.push(format!("{}{}", indent, name));
        }
    }
    lines.join("\n")
}
