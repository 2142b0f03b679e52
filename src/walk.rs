use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use walkdir::{DirEntry, WalkDir};

use crate::error_codes::{CodedError, MISSING_INPUT};
use crate::manifest::MANIFEST_FILE;

/// Case-insensitive substring filter applied to directory names below the walk root.
#[derive(Debug, Clone)]
pub struct SkipPattern {
    needle: String,
}

impl SkipPattern {
    pub fn new(pattern: &str) -> Self {
        Self {
            needle: pattern.to_lowercase(),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        !self.needle.is_empty() && name.to_lowercase().contains(&self.needle)
    }
}

fn ensure_dir(root: &Path) -> Result<()> {
    if !root.is_dir() {
        return Err(anyhow!(CodedError::usage(
            MISSING_INPUT,
            format!("not a directory: {}", root.display()),
        )));
    }
    Ok(())
}

fn walker(root: &Path, recursive: bool, skip: &SkipPattern) -> impl Iterator<Item = DirEntry> {
    let skip = skip.clone();
    let mut walk = WalkDir::new(root).sort_by_file_name();
    if !recursive {
        walk = walk.max_depth(1);
    }
    walk.into_iter()
        .filter_entry(move |entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            if skip.matches(&name) {
                tracing::info!(path = %entry.path().display(), "skipping directory");
                return false;
            }
            true
        })
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(error) => {
                tracing::warn!(%error, "failed to read directory entry");
                None
            }
        })
}

/// Every directory under `root` (inclusive) that holds a `global_props.json`, in sorted order.
pub fn manifest_folders(root: &Path, skip: &SkipPattern) -> Result<Vec<PathBuf>> {
    ensure_dir(root)?;
    let mut folders = walker(root, true, skip)
        .filter(|entry| entry.file_type().is_dir())
        .filter(|entry| entry.path().join(MANIFEST_FILE).is_file())
        .map(DirEntry::into_path)
        .collect::<Vec<_>>();
    folders.sort();
    tracing::debug!(root = %root.display(), count = folders.len(), "found manifest folders");
    Ok(folders)
}

/// `root` and every directory below it that is not skipped, in sorted order.
pub fn folders(root: &Path, skip: &SkipPattern) -> Result<Vec<PathBuf>> {
    ensure_dir(root)?;
    let mut folders = walker(root, true, skip)
        .filter(|entry| entry.file_type().is_dir())
        .map(DirEntry::into_path)
        .collect::<Vec<_>>();
    folders.sort();
    Ok(folders)
}

/// Files below `root` whose extension matches one of `extensions`, ignoring case.
pub fn files_with_extension(
    root: &Path,
    extensions: &[&str],
    recursive: bool,
    skip: &SkipPattern,
) -> Result<Vec<PathBuf>> {
    ensure_dir(root)?;
    let mut files = walker(root, recursive, skip)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| has_extension(entry.path(), extensions))
        .map(DirEntry::into_path)
        .collect::<Vec<_>>();
    files.sort();
    Ok(files)
}

pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            extensions
                .iter()
                .any(|wanted| ext.eq_ignore_ascii_case(wanted.trim_start_matches('.')))
        })
}

/// File stem as UTF-8, for building sibling file names.
pub fn stem(path: &Path) -> Result<String> {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .with_context(|| format!("path has no file name: {}", path.display()))
}
