use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use crate::atomic::{persist_over, sibling_temp_path};
use crate::config::{Config, EncodeConfig, PresentationConfig};
use crate::ffmpeg::{FfmpegCommand, Tools};
use crate::probe::{media_info, MediaInfo};
use crate::report::BatchReport;
use crate::walk::{folders, SkipPattern};

const SILENT_AUDIO: &str = "anullsrc=r=48000:cl=stereo";

/// Formats a filter argument without float noise (`30`, `29.97`).
pub(crate) fn filter_number(value: f64) -> String {
    let text = format!("{value:.3}");
    text.trim_end_matches('0').trim_end_matches('.').to_owned()
}

/// Video chains for both parts plus the concat node. Audio labels are passed in because
/// a part without audio reads from a generated silent input instead.
pub fn prepend_filter(
    settings: &PresentationConfig,
    fps: f64,
    intro_duration: f64,
    intro_audio: &str,
    body_audio: &str,
) -> String {
    let fps = filter_number(fps);
    let fade = filter_number(settings.fade_secs);
    let fade_out_start = filter_number((intro_duration - settings.fade_secs).max(0.0));
    let scale = format!("scale={}:{},setsar=1", settings.width, settings.height);
    format!(
        "[0:v]fps={fps},{scale},fade=t=out:st={fade_out_start}:d={fade}[v0];\
         [1:v]fps={fps},{scale},fade=t=in:st=0:d={fade}[v1];\
         [v0]{intro_audio}[v1]{body_audio}concat=n=2:v=1:a=1[outv][outa]"
    )
}

pub fn build_prepend_command(
    ffmpeg: &Path,
    settings: &PresentationConfig,
    encode: &EncodeConfig,
    intro: (&Path, &MediaInfo),
    body: (&Path, &MediaInfo),
    output: &Path,
) -> Result<FfmpegCommand> {
    let (intro_path, intro_info) = intro;
    let (body_path, body_info) = body;
    let fps = intro_info
        .fps
        .ok_or_else(|| anyhow!("could not read the frame rate of {}", intro_path.display()))?;
    let intro_duration = intro_info
        .duration_seconds
        .ok_or_else(|| anyhow!("could not read the duration of {}", intro_path.display()))?;

    let mut command = FfmpegCommand::new(ffmpeg).input(intro_path).input(body_path);
    let mut audio_labels = Vec::with_capacity(2);
    let mut next_input = 2;
    for (index, info) in [intro_info, body_info].into_iter().enumerate() {
        if info.has_audio {
            audio_labels.push(format!("[{index}:a]"));
        } else {
            command = command.lavfi_input(SILENT_AUDIO, info.duration_seconds.unwrap_or_default());
            audio_labels.push(format!("[{next_input}:a]"));
            next_input += 1;
        }
    }

    let graph = prepend_filter(
        settings,
        fps,
        intro_duration,
        &audio_labels[0],
        &audio_labels[1],
    );
    Ok(command
        .filter_complex(&graph)
        .map("[outv]")
        .map("[outa]")
        .args(encode.output_args())
        .output(output))
}

pub fn prepend_folder(tools: &Tools, config: &Config, folder: &Path) -> Result<PathBuf> {
    let settings = &config.presentation;
    let intro = folder.join(&settings.intro);
    let body = folder.join(&settings.body);
    let output = folder.join(&settings.output);

    let intro_info = media_info(&tools.ffprobe, &intro)?;
    let body_info = media_info(&tools.ffprobe, &body)?;

    let temp = sibling_temp_path(&output)?;
    let command = build_prepend_command(
        &tools.ffmpeg,
        settings,
        &config.encode,
        (&intro, &intro_info),
        (&body, &body_info),
        &temp,
    )?;

    // Body frames are counted at the intro rate because both parts are resampled to it.
    let total_frames = intro_info.frame_count().zip(
        body_info
            .duration_seconds
            .zip(intro_info.fps)
            .map(|(duration, fps)| (duration * fps).round() as u64),
    );
    let mut last_logged = 0_u32;
    command
        .run_with_progress(total_frames.map(|(a, b)| a + b), |percent| {
            let step = (percent / 10.0) as u32;
            if step > last_logged {
                last_logged = step;
                tracing::info!(folder = %folder.display(), "prepending intro: {:.0}%", percent);
            }
        })
        .with_context(|| format!("failed to prepend intro in {}", folder.display()))?;
    persist_over(temp, &output)?;
    Ok(output)
}

pub fn prepend_tree(tools: &Tools, config: &Config, root: &Path) -> Result<BatchReport> {
    let skip = SkipPattern::new(&config.walk.skip_dir_pattern);
    let settings = &config.presentation;
    let mut report = BatchReport::new("prepend");

    for folder in folders(root, &skip)? {
        let has_intro = folder.join(&settings.intro).is_file();
        let has_body = folder.join(&settings.body).is_file();
        match (has_intro, has_body) {
            (false, false) => continue,
            (true, false) => {
                report.skipped(&folder, format!("missing {}", settings.body));
                continue;
            }
            (false, true) => {
                report.skipped(&folder, format!("missing {}", settings.intro));
                continue;
            }
            (true, true) => {}
        }
        match prepend_folder(tools, config, &folder) {
            Ok(output) => report.ok(&folder, output.display().to_string()),
            Err(error) => report.failed(&folder, &error),
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{build_prepend_command, filter_number, prepend_filter};
    use crate::config::{EncodeConfig, PresentationConfig};
    use crate::probe::MediaInfo;

    fn info(duration: f64, has_audio: bool) -> MediaInfo {
        MediaInfo {
            duration_seconds: Some(duration),
            width: Some(1280),
            height: Some(720),
            fps: Some(30.0),
            frames: None,
            has_video: true,
            has_audio,
            audio_sample_rate: None,
            audio_channels: None,
        }
    }

    #[test]
    fn numbers_render_without_trailing_zeros() {
        assert_eq!(filter_number(30.0), "30");
        assert_eq!(filter_number(30000.0 / 1001.0), "29.97");
        assert_eq!(filter_number(7.5), "7.5");
    }

    #[test]
    fn intro_fades_out_over_its_last_second() {
        let graph = prepend_filter(&PresentationConfig::default(), 30.0, 8.0, "[0:a]", "[1:a]");
        assert_eq!(
            graph,
            "[0:v]fps=30,scale=1920:1080,setsar=1,fade=t=out:st=7:d=1[v0];\
             [1:v]fps=30,scale=1920:1080,setsar=1,fade=t=in:st=0:d=1[v1];\
             [v0][0:a][v1][1:a]concat=n=2:v=1:a=1[outv][outa]"
        );
    }

    #[test]
    fn short_intro_starts_fade_at_zero() {
        let graph = prepend_filter(&PresentationConfig::default(), 25.0, 0.5, "[0:a]", "[1:a]");
        assert!(graph.contains("fade=t=out:st=0:d=1[v0]"));
    }

    #[test]
    fn silent_intro_reads_generated_audio() {
        let command = build_prepend_command(
            Path::new("ffmpeg"),
            &PresentationConfig::default(),
            &EncodeConfig::default(),
            (Path::new("global_props.mp4"), &info(8.0, false)),
            (Path::new("output.mp4"), &info(60.0, true)),
            Path::new("presentation.mp4"),
        )
        .expect("command should build");
        let joined = command
            .to_args()
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        assert!(joined.contains("-i global_props.mp4 -i output.mp4 -f lavfi -t 8.000"));
        assert!(joined.contains("[v0][2:a][v1][1:a]concat=n=2"));
        assert!(joined.ends_with("presentation.mp4"));
    }
}
