use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::atomic::{persist_over, sibling_temp_path};
use crate::config::Config;
use crate::ffmpeg::{FfmpegCommand, Tools};
use crate::manifest::Manifest;
use crate::presentation::filter_number;
use crate::probe::duration_seconds;
use crate::report::BatchReport;
use crate::tts::{is_character_limit, TtsClient};
use crate::walk::{manifest_folders, SkipPattern};

const DURATION_TOLERANCE_SECS: f64 = 0.1;

/// Pads or trims the narration to exactly `duration` seconds.
pub fn narration_filter(duration: f64) -> String {
    let duration = filter_number(duration);
    format!("[1:a]apad=whole_dur={duration}[apadded];[apadded]atrim=0:{duration}[atrimmed]")
}

pub fn build_mux_command(ffmpeg: &Path, video: &Path, audio: &Path, duration: f64, output: &Path) -> FfmpegCommand {
    FfmpegCommand::new(ffmpeg)
        .input(video)
        .input(audio)
        .filter_complex(&narration_filter(duration))
        .map("0:v")
        .map("[atrimmed]")
        .args(["-c:v", "copy", "-c:a", "aac", "-shortest"])
        .output(output)
}

/// Replaces the audio of the folder's intro video with the synthesized current
/// transcript. `None` when the manifest has no transcript.
pub async fn narrate_folder(
    tools: &Tools,
    config: &Config,
    client: &TtsClient,
    folder: &Path,
) -> Result<Option<PathBuf>> {
    let manifest = Manifest::load(folder)?;
    let Some(text) = manifest.current_transcript() else {
        return Ok(None);
    };
    let video = folder.join(&config.intro.output);
    let duration = duration_seconds(&tools.ffprobe, &video)?;

    let audio = client.synthesize(text).await?;
    let narration = sibling_temp_path(&folder.join("narration.mp3"))?;
    fs::write(&narration, audio)
        .with_context(|| format!("failed to write {}", narration.display()))?;

    let temp = sibling_temp_path(&video)?;
    build_mux_command(&tools.ffmpeg, &video, &narration, duration, &temp)
        .run()
        .with_context(|| format!("failed to add narration in {}", folder.display()))?;

    let muxed = duration_seconds(&tools.ffprobe, &temp)?;
    if (muxed - duration).abs() > DURATION_TOLERANCE_SECS {
        bail!(
            "narrated video is {muxed:.3}s but {} is {duration:.3}s",
            video.display()
        );
    }
    persist_over(temp, &video)?;
    Ok(Some(video))
}

pub async fn narrate_tree(
    tools: &Tools,
    config: &Config,
    client: &TtsClient,
    root: &Path,
) -> Result<BatchReport> {
    let skip = SkipPattern::new(&config.walk.skip_dir_pattern);
    let mut report = BatchReport::new("narrate");

    for folder in manifest_folders(root, &skip)? {
        if !folder.join(&config.intro.output).is_file() {
            report.skipped(&folder, format!("missing {}", config.intro.output));
            continue;
        }
        match narrate_folder(tools, config, client, &folder).await {
            Ok(Some(video)) => report.ok(&folder, video.display().to_string()),
            Ok(None) => report.skipped(&folder, "manifest has no transcript"),
            Err(error) if is_character_limit(&error) => {
                report.failed(&folder, &error);
                report.stop("TTS character limit reached");
                break;
            }
            Err(error) => report.failed(&folder, &error),
        }
    }

    Ok(report)
}
