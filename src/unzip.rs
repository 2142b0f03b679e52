use std::fs::{self, File};
use std::io;
use std::path::Path;

use anyhow::{bail, Context, Result};
use zip::ZipArchive;

use crate::config::Config;
use crate::report::BatchReport;
use crate::walk::{files_with_extension, stem, SkipPattern};

/// Extracts one archive into `target`, returning the number of files written. Entries
/// whose names would land outside `target` fail the whole archive.
pub fn extract_archive(archive_path: &Path, target: &Path) -> Result<usize> {
    let file = File::open(archive_path)
        .with_context(|| format!("failed to open {}", archive_path.display()))?;
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("failed to read zip archive {}", archive_path.display()))?;
    fs::create_dir_all(target)
        .with_context(|| format!("failed to create {}", target.display()))?;

    let mut extracted = 0;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read entry {index} of {}", archive_path.display()))?;
        let Some(relative) = entry.enclosed_name() else {
            bail!("archive entry '{}' escapes the extraction folder", entry.name());
        };
        let out_path = target.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)
                .with_context(|| format!("failed to create {}", out_path.display()))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut out = File::create(&out_path)
            .with_context(|| format!("failed to create {}", out_path.display()))?;
        io::copy(&mut entry, &mut out)
            .with_context(|| format!("failed to extract {}", out_path.display()))?;
        extracted += 1;
    }
    Ok(extracted)
}

/// Every `*.zip` directly in `dir` goes to `dir/<stem>/`.
pub fn unzip_dir(config: &Config, dir: &Path) -> Result<BatchReport> {
    let skip = SkipPattern::new(&config.walk.skip_dir_pattern);
    let mut report = BatchReport::new("unzip");

    for archive in files_with_extension(dir, &["zip"], false, &skip)? {
        let result = stem(&archive).and_then(|name| extract_archive(&archive, &dir.join(name)));
        match result {
            Ok(count) => report.ok(&archive, format!("{count} files")),
            Err(error) => report.failed(&archive, &error),
        }
    }

    Ok(report)
}
