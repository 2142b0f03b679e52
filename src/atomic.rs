use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tempfile::{Builder, TempPath};

fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Writes `bytes` to a temporary file next to `path` and renames it into place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut temp = Builder::new()
        .prefix(".clipbatch-")
        .suffix(".tmp")
        .tempfile_in(parent_dir(path))
        .with_context(|| format!("failed to create temporary file for {}", path.display()))?;
    temp.write_all(bytes)
        .with_context(|| format!("failed to write temporary file for {}", path.display()))?;
    temp.as_file()
        .sync_all()
        .with_context(|| format!("failed to sync temporary file for {}", path.display()))?;
    temp.persist(path)
        .map_err(|error| error.error)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut json = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    json.push(b'\n');
    write_atomic(path, &json)
}

/// Reserves a temporary path beside `target` with the same extension, for tools that
/// write their own output file. The file is deleted when the returned path drops.
pub fn sibling_temp_path(target: &Path) -> Result<TempPath> {
    let suffix = target
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let temp = Builder::new()
        .prefix(".clipbatch-")
        .suffix(&suffix)
        .tempfile_in(parent_dir(target))
        .with_context(|| format!("failed to create temporary file for {}", target.display()))?;
    Ok(temp.into_temp_path())
}

/// Moves a finished temporary file over `target`.
pub fn persist_over(temp: TempPath, target: &Path) -> Result<()> {
    temp.persist(target)
        .map_err(|error| error.error)
        .with_context(|| format!("failed to replace {}", target.display()))
}
