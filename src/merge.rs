use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};

use crate::atomic::{persist_over, sibling_temp_path};
use crate::config::{Config, EncodeConfig};
use crate::ffmpeg::{FfmpegCommand, Tools};
use crate::manifest::{ErrorClip, Manifest};
use crate::probe::{media_info, verify_clip, MediaInfo};
use crate::report::BatchReport;
use crate::walk::{manifest_folders, SkipPattern};

const SILENT_AUDIO: &str = "anullsrc=r=48000:cl=stereo";

#[derive(Debug, Clone)]
pub struct VerifiedClip {
    pub name: String,
    pub path: PathBuf,
    pub info: MediaInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Merged {
        output: PathBuf,
        clips: usize,
        dropped: usize,
    },
    /// Nothing survived verification; the folder is left untouched.
    NoValidClips { dropped: usize },
    DryRun { valid: usize, dropped: usize },
}

/// Verifies every clip named in `order`. Clips that fail are returned as error entries
/// instead of aborting.
pub fn verify_order(
    tools: &Tools,
    folder: &Path,
    order: &[String],
) -> (Vec<VerifiedClip>, Vec<ErrorClip>) {
    let mut valid = Vec::new();
    let mut dropped = Vec::new();

    for name in order {
        let path = folder.join(name);
        let checked = verify_clip(&tools.ffprobe, &path)
            .and_then(|packets| {
                let info = media_info(&tools.ffprobe, &path)?;
                if !info.has_audio && info.duration_seconds.is_none() {
                    bail!("clip has no audio stream and no known duration");
                }
                Ok((packets, info))
            });
        match checked {
            Ok((packets, info)) => {
                tracing::debug!(clip = %name, packets, has_audio = info.has_audio, "clip verified");
                valid.push(VerifiedClip {
                    name: name.clone(),
                    path,
                    info,
                });
            }
            Err(error) => {
                tracing::warn!(clip = %name, folder = %folder.display(), "dropping clip: {error:#}");
                dropped.push(ErrorClip {
                    clip: name.clone(),
                    error: format!("{error:#}"),
                });
            }
        }
    }

    (valid, dropped)
}

/// One concat graph over all clips. Clips without audio are paired with a silent lavfi
/// input appended after the clip inputs.
pub fn build_merge_command(
    ffmpeg: &Path,
    clips: &[VerifiedClip],
    encode: &EncodeConfig,
    output: &Path,
) -> FfmpegCommand {
    let mut command = FfmpegCommand::new(ffmpeg);
    for clip in clips {
        command = command.input(&clip.path);
    }

    let mut graph = String::new();
    let mut next_input = clips.len();
    for (index, clip) in clips.iter().enumerate() {
        if clip.info.has_audio {
            graph.push_str(&format!("[{index}:v:0][{index}:a:0]"));
        } else {
            let duration = clip.info.duration_seconds.unwrap_or_default();
            command = command.lavfi_input(SILENT_AUDIO, duration);
            graph.push_str(&format!("[{index}:v:0][{next_input}:a:0]"));
            next_input += 1;
        }
    }
    graph.push_str(&format!("concat=n={}:v=1:a=1[outv][outa]", clips.len()));

    command
        .filter_complex(&graph)
        .map("[outv]")
        .map("[outa]")
        .args(encode.output_args())
        .output(output)
}

pub fn merge_folder(
    tools: &Tools,
    config: &Config,
    folder: &Path,
    dry_run: bool,
) -> Result<MergeOutcome> {
    let mut manifest = Manifest::load(folder)?;
    if manifest.order.is_empty() {
        bail!("manifest has an empty order list");
    }

    let (valid, dropped) = verify_order(tools, folder, &manifest.order);
    if valid.is_empty() {
        tracing::warn!(folder = %folder.display(), dropped = dropped.len(), "no valid clips to merge");
        return Ok(MergeOutcome::NoValidClips {
            dropped: dropped.len(),
        });
    }
    if dry_run {
        return Ok(MergeOutcome::DryRun {
            valid: valid.len(),
            dropped: dropped.len(),
        });
    }

    // The manifest is rewritten before encoding starts.
    let dropped_count = dropped.len();
    manifest.order = valid.iter().map(|clip| clip.name.clone()).collect();
    manifest.error_clips.extend(dropped);
    manifest.save(folder)?;

    let output = folder.join(&config.merge.output);
    let temp = sibling_temp_path(&output)?;
    let command = build_merge_command(&tools.ffmpeg, &valid, &config.encode, &temp);
    let total_frames = valid
        .iter()
        .map(|clip| clip.info.frame_count())
        .sum::<Option<u64>>();
    let mut last_logged = 0_u32;
    command
        .run_with_progress(total_frames, |percent| {
            let step = (percent / 10.0) as u32;
            if step > last_logged {
                last_logged = step;
                tracing::info!(folder = %folder.display(), "merging: {:.0}%", percent);
            }
        })
        .with_context(|| format!("failed to merge clips in {}", folder.display()))?;
    persist_over(temp, &output)?;

    Ok(MergeOutcome::Merged {
        output,
        clips: valid.len(),
        dropped: dropped_count,
    })
}

pub fn merge_tree(tools: &Tools, config: &Config, root: &Path, dry_run: bool) -> Result<BatchReport> {
    let skip = SkipPattern::new(&config.walk.skip_dir_pattern);
    let mut report = BatchReport::new("merge");

    for folder in manifest_folders(root, &skip)? {
        tracing::info!(folder = %folder.display(), "merging folder");
        match merge_folder(tools, config, &folder, dry_run) {
            Ok(MergeOutcome::Merged {
                output,
                clips,
                dropped,
            }) => report.ok(
                &folder,
                format!("{} ({clips} clips, {dropped} dropped)", output.display()),
            ),
            Ok(MergeOutcome::NoValidClips { dropped }) => report.failed(
                &folder,
                &anyhow!("no valid clips ({dropped} dropped); manifest left unchanged"),
            ),
            Ok(MergeOutcome::DryRun { valid, dropped }) => {
                report.ok(&folder, format!("dry run: {valid} valid, {dropped} dropped"))
            }
            Err(error) => report.failed(&folder, &error),
        }
    }

    Ok(report)
}
