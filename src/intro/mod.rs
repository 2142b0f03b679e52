//! Intro slide rendering: title, subtitle and a dot-filled chapter list on a white
//! canvas with an image placeholder panel, encoded to `global_props.mp4`.

pub mod layout;
pub mod render;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::atomic::{persist_over, sibling_temp_path};
use crate::config::{Config, EncodeConfig};
use crate::encoding::{FfmpegPipe, PipeSpec};
use crate::ffmpeg::Tools;
use crate::manifest::{ClipMetadata, Manifest};
use crate::probe::duration_seconds;
use crate::report::BatchReport;
use crate::walk::{manifest_folders, stem, SkipPattern};

use layout::{compute_layout, ChapterLine, IntroContent, IntroLayout};
use render::{base_frame, render_frame, resolve_font_path, save_png, TextPainter};

/// `M:SS` below an hour, `H:MM:SS` above.
pub fn format_timestamp(seconds: f64) -> String {
    let total = seconds.max(0.0).floor() as u64;
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

/// Splits a stored chapter line `"1:05 Label"` into its time and label.
pub fn parse_chapter_line(line: &str) -> ChapterLine {
    let trimmed = line.trim();
    if let Some((time, label)) = trimmed.split_once(char::is_whitespace) {
        let is_time = time.contains(':')
            && time.split(':').all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()));
        if is_time {
            return ChapterLine::Timed {
                label: label.trim().to_owned(),
                time: time.to_owned(),
            };
        }
    }
    ChapterLine::Plain(trimmed.to_owned())
}

/// Chapter lines for every clip in `order`, starting after the intro. Labels come from
/// the clip sidecar (`title`, then `label`), else the file stem; durations from the
/// sidecar, else ffprobe.
pub fn compute_chapters(
    tools: &Tools,
    folder: &Path,
    order: &[String],
    intro_duration: f64,
) -> Result<Vec<String>> {
    let mut start = intro_duration;
    let mut lines = Vec::with_capacity(order.len());
    for name in order {
        let clip = folder.join(name);
        let sidecar_path = ClipMetadata::sidecar_path(&clip);
        let sidecar = if sidecar_path.is_file() {
            match ClipMetadata::load(&sidecar_path) {
                Ok(metadata) => Some(metadata),
                Err(error) => {
                    tracing::warn!(path = %sidecar_path.display(), "ignoring sidecar: {error:#}");
                    None
                }
            }
        } else {
            None
        };

        let label = match sidecar.as_ref().and_then(ClipMetadata::display_label) {
            Some(label) => label.to_owned(),
            None => stem(&clip)?,
        };
        let duration = match sidecar.as_ref().and_then(|metadata| metadata.duration) {
            Some(duration) => duration,
            None => duration_seconds(&tools.ffprobe, &clip)
                .with_context(|| format!("failed to get duration of clip {name}"))?,
        };

        lines.push(format!("{} {label}", format_timestamp(start)));
        start += duration;
    }
    Ok(lines)
}

/// Reads the intro text from the manifest. Chapter lines missing from the manifest are
/// computed, and stored back only when `store_chapters` is set.
fn load_content(
    tools: &Tools,
    config: &Config,
    folder: &Path,
    store_chapters: bool,
) -> Result<IntroContent> {
    let mut manifest = Manifest::load(folder)?;
    let stored = manifest
        .timestamps
        .clone()
        .filter(|timestamps| !timestamps.is_empty());
    let lines = match stored {
        Some(lines) => lines,
        None if manifest.order.is_empty() => Vec::new(),
        None => {
            let lines = compute_chapters(tools, folder, &manifest.order, config.intro.duration_secs)?;
            if store_chapters {
                manifest.timestamps = Some(lines.clone());
                manifest.save(folder)?;
            }
            lines
        }
    };

    Ok(IntroContent {
        title: manifest.title.clone().filter(|title| !title.trim().is_empty()),
        subtitle: manifest
            .subtitle
            .clone()
            .filter(|subtitle| !subtitle.trim().is_empty()),
        chapters: lines.iter().map(|line| parse_chapter_line(line)).collect(),
    })
}

fn encode_intro(
    tools: &Tools,
    encode: &EncodeConfig,
    painter: &mut TextPainter,
    layout: &IntroLayout,
    fps: u32,
    duration: f64,
    output: &Path,
) -> Result<()> {
    let spec = PipeSpec {
        width: layout.width,
        height: layout.height,
        fps,
        encode: encode.clone(),
    };
    let frames = (duration * f64::from(fps)).round().max(1.0) as u64;
    let base = base_frame(layout);
    let settle = layout
        .elements
        .iter()
        .map(|element| element.start + layout.fade_secs)
        .fold(0.0_f64, f64::max);

    let pipe = FfmpegPipe::spawn(&tools.ffmpeg, &spec, output)?;
    let mut settled: Option<Vec<u8>> = None;
    for index in 0..frames {
        let t = index as f64 / f64::from(fps);
        let frame = if t >= settle {
            settled
                .get_or_insert_with(|| render_frame(painter, layout, &base, t))
                .clone()
        } else {
            render_frame(painter, layout, &base, t)
        };
        pipe.write_frame(frame)?;
    }
    pipe.finish()
}

/// Renders the intro for one manifest folder. With `still`, writes the final frame as a
/// PNG (relative to the folder) instead of encoding video.
pub fn render_folder(
    tools: &Tools,
    config: &Config,
    folder: &Path,
    still: Option<&Path>,
) -> Result<Option<PathBuf>> {
    let settings = &config.intro;
    let content = load_content(tools, config, folder, still.is_none())?;
    if content.is_empty() {
        return Ok(None);
    }

    let font_path = resolve_font_path(settings.font_path.as_deref())?;
    let mut painter = TextPainter::from_file(&font_path)?;
    for text in content.title.iter().chain(content.subtitle.iter()) {
        painter.warn_missing_glyphs(text);
    }
    let layout = compute_layout(&painter, settings, &content)?;

    if let Some(still) = still {
        let path = folder.join(still);
        let frame = render_frame(&mut painter, &layout, &base_frame(&layout), settings.duration_secs);
        save_png(&path, layout.width, layout.height, frame)?;
        return Ok(Some(path));
    }

    let output = folder.join(&settings.output);
    let temp = sibling_temp_path(&output)?;
    encode_intro(
        tools,
        &config.encode,
        &mut painter,
        &layout,
        settings.fps,
        settings.duration_secs,
        &temp,
    )
    .with_context(|| format!("failed to encode intro in {}", folder.display()))?;
    persist_over(temp, &output)?;
    Ok(Some(output))
}

pub fn render_tree(
    tools: &Tools,
    config: &Config,
    root: &Path,
    still: Option<&Path>,
) -> Result<BatchReport> {
    let skip = SkipPattern::new(&config.walk.skip_dir_pattern);
    let mut report = BatchReport::new("intro");

    for folder in manifest_folders(root, &skip)? {
        match render_folder(tools, config, &folder, still) {
            Ok(Some(output)) => report.ok(&folder, output.display().to_string()),
            Ok(None) => report.skipped(&folder, "manifest has no title, subtitle or clips"),
            Err(error) => report.failed(&folder, &error),
        }
    }

    Ok(report)
}
