use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::atomic::write_atomic;

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(text.lines().map(str::to_owned).collect())
}

fn write_lines<'a>(path: &Path, lines: impl IntoIterator<Item = &'a String>) -> Result<()> {
    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    write_atomic(path, out.as_bytes())
}

/// Byte-order sort; duplicates are kept. Returns the line count.
pub fn sort_file(input: &Path, output: &Path) -> Result<usize> {
    let mut lines = read_lines(input)?;
    lines.sort();
    write_lines(output, &lines)?;
    Ok(lines.len())
}

/// Lines of `a` that never appear in `b`, unique and sorted.
pub fn diff_lines(a: &[String], b: &[String]) -> Vec<String> {
    let exclude = b.iter().collect::<BTreeSet<_>>();
    a.iter()
        .filter(|line| !exclude.contains(line))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn diff_files(a: &Path, b: &Path, output: &Path) -> Result<usize> {
    let differences = diff_lines(&read_lines(a)?, &read_lines(b)?);
    write_lines(output, &differences)?;
    Ok(differences.len())
}
