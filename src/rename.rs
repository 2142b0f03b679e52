use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;

use crate::config::Config;
use crate::report::BatchReport;
use crate::walk::{files_with_extension, SkipPattern};

const RECORDED_COLUMN: &str = "Recorded Name";
const ACTUAL_COLUMN: &str = "Actual Name";

fn camera_clip_regex() -> &'static Regex {
    static CAMERA_CLIP_RE: OnceLock<Regex> = OnceLock::new();
    CAMERA_CLIP_RE
        .get_or_init(|| Regex::new(r"_(\d{4})_D\.MP4$").expect("camera clip regex should compile"))
}

/// `C0001_20240809_0042_D.MP4` -> `0042.MP4`.
pub fn camera_clip_target(file_name: &str) -> Option<String> {
    camera_clip_regex()
        .captures(file_name)
        .map(|captures| format!("{}.MP4", &captures[1]))
}

/// Renames camera clips below `root` to their four-digit clip number.
pub fn rename_clips(config: &Config, root: &Path) -> Result<BatchReport> {
    let skip = SkipPattern::new(&config.walk.skip_dir_pattern);
    let mut report = BatchReport::new("rename-clips");

    for clip in files_with_extension(root, &["mp4"], true, &skip)? {
        let file_name = clip
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some(target_name) = camera_clip_target(&file_name) else {
            report.skipped(&clip, "doesn't match the *_NNNN_D.MP4 pattern");
            continue;
        };
        let target = clip.with_file_name(&target_name);
        match rename_no_clobber(&clip, &target) {
            Ok(()) => report.ok(&clip, target_name),
            Err(error) => report.failed(&clip, &error),
        }
    }

    Ok(report)
}

fn rename_no_clobber(from: &Path, to: &Path) -> Result<()> {
    if to.exists() {
        bail!("{} already exists", to.display());
    }
    fs::rename(from, to)
        .with_context(|| format!("failed to rename {} to {}", from.display(), to.display()))
}

/// Parses CSV text into records. Handles quoted fields, doubled quotes inside them,
/// CRLF line endings and a leading byte-order mark.
pub fn parse_csv(text: &str) -> Result<Vec<Vec<String>>> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' | '\r' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }
    if in_quotes {
        bail!("unterminated quoted field in CSV");
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    records.retain(|record| !(record.len() == 1 && record[0].is_empty()));
    Ok(records)
}

/// Keeps `[A-Za-z0-9_-. ]`, replaces everything else with `_`, trims and turns spaces
/// into underscores.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim()
        .replace(' ', "_")
}

/// `<name>.MP4`, or the first free `<name>_N.MP4`.
pub fn unique_target(folder: &Path, name: &str) -> PathBuf {
    let mut target = folder.join(format!("{name}.MP4"));
    let mut counter = 1;
    while target.exists() {
        target = folder.join(format!("{name}_{counter}.MP4"));
        counter += 1;
    }
    target
}

/// Renames clips in `folder` according to the `Recorded Name` -> `Actual Name` columns.
pub fn rename_from_csv(csv_path: &Path, folder: &Path) -> Result<BatchReport> {
    let raw = fs::read_to_string(csv_path)
        .with_context(|| format!("failed to read {}", csv_path.display()))?;
    let records =
        parse_csv(&raw).with_context(|| format!("failed to parse {}", csv_path.display()))?;
    let (header, rows) = records
        .split_first()
        .ok_or_else(|| anyhow!("{} is empty", csv_path.display()))?;
    let column = |name: &str| {
        header
            .iter()
            .position(|cell| cell.trim() == name)
            .ok_or_else(|| anyhow!("{} has no '{name}' column", csv_path.display()))
    };
    let recorded_index = column(RECORDED_COLUMN)?;
    let actual_index = column(ACTUAL_COLUMN)?;

    let mut report = BatchReport::new("rename-csv");
    for row in rows {
        let (Some(recorded), Some(actual)) = (row.get(recorded_index), row.get(actual_index)) else {
            report.skipped(csv_path, format!("short row: {}", row.join(",")));
            continue;
        };
        let source = folder.join(recorded);
        if !source.is_file() {
            report.skipped(&source, "file not found");
            continue;
        }
        let sanitized = sanitize_name(actual);
        if sanitized.is_empty() {
            report.skipped(&source, "actual name is empty");
            continue;
        }
        let target = unique_target(folder, &sanitized);
        match rename_no_clobber(&source, &target) {
            Ok(()) => report.ok(&source, target.display().to_string()),
            Err(error) => report.failed(&source, &error),
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::{camera_clip_target, parse_csv, rename_clips, rename_from_csv, sanitize_name};
    use crate::config::Config;
    use crate::report::ItemStatus;

    #[test]
    fn camera_clip_names_keep_the_clip_number() {
        assert_eq!(
            camera_clip_target("C0001_20240809_0042_D.MP4").as_deref(),
            Some("0042.MP4")
        );
        assert_eq!(camera_clip_target("intro.MP4"), None);
        assert_eq!(camera_clip_target("X_0042_D.mp4"), None);
    }

    #[test]
    fn csv_handles_quotes_crlf_and_bom() {
        let text = "\u{feff}Recorded Name,Actual Name\r\n\"a,1.MP4\",\"Say \"\"hi\"\"\"\r\nb.MP4,Plain\r\n\r\n";
        let records = parse_csv(text).expect("csv should parse");
        assert_eq!(
            records,
            vec![
                vec!["Recorded Name".to_owned(), "Actual Name".to_owned()],
                vec!["a,1.MP4".to_owned(), "Say \"hi\"".to_owned()],
                vec!["b.MP4".to_owned(), "Plain".to_owned()],
            ]
        );
        assert!(parse_csv("\"open").is_err());
    }

    #[test]
    fn sanitizes_actual_names() {
        assert_eq!(sanitize_name("  Step 1: Load/Unload  "), "Step_1__Load_Unload");
        assert_eq!(sanitize_name("Intro-v2.final"), "Intro-v2.final");
    }

    #[test]
    fn rename_clips_never_overwrites() {
        let dir = tempdir().expect("tempdir should be created");
        let day = dir.path().join("day1");
        fs::create_dir(&day).expect("folder should be created");
        fs::write(day.join("C0001_0001_D.MP4"), b"a").expect("clip should be written");
        fs::write(day.join("C0002_0002_D.MP4"), b"b").expect("clip should be written");
        fs::write(day.join("0002.MP4"), b"existing").expect("clip should be written");

        let report = rename_clips(&Config::default(), dir.path()).expect("rename should run");
        assert!(day.join("0001.MP4").is_file());
        assert!(day.join("C0002_0002_D.MP4").is_file());
        assert_eq!(fs::read(day.join("0002.MP4")).expect("file should exist"), b"existing");
        assert_eq!(report.count(ItemStatus::Ok), 1);
        assert_eq!(report.count(ItemStatus::Failed), 1);
        assert_eq!(report.count(ItemStatus::Skipped), 1);
    }

    #[test]
    fn csv_rename_deduplicates_and_skips_missing() {
        let dir = tempdir().expect("tempdir should be created");
        fs::write(dir.path().join("r1.MP4"), b"1").expect("clip should be written");
        fs::write(dir.path().join("r2.MP4"), b"2").expect("clip should be written");
        let csv = dir.path().join("names.csv");
        fs::write(
            &csv,
            "Recorded Name,Actual Name\nr1.MP4,Safety Intro\nr2.MP4,Safety Intro\nmissing.MP4,Gone\n",
        )
        .expect("csv should be written");

        let report = rename_from_csv(&csv, dir.path()).expect("rename should run");
        assert_eq!(fs::read(dir.path().join("Safety_Intro.MP4")).expect("first"), b"1");
        assert_eq!(fs::read(dir.path().join("Safety_Intro_1.MP4")).expect("second"), b"2");
        assert_eq!(report.count(ItemStatus::Ok), 2);
        assert_eq!(report.count(ItemStatus::Skipped), 1);
    }
}
