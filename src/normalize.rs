use std::path::Path;

use anyhow::{Context, Result};

use crate::atomic::{persist_over, sibling_temp_path};
use crate::config::Config;
use crate::ffmpeg::{FfmpegCommand, Tools};
use crate::probe::{media_info, MediaInfo};
use crate::report::BatchReport;
use crate::walk::{files_with_extension, SkipPattern};

pub const TARGET_SAMPLE_RATE: u32 = 48_000;
pub const TARGET_CHANNELS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCheck {
    NoAudio,
    AlreadyNormalized,
    NeedsResample,
}

pub fn check_audio(info: &MediaInfo) -> AudioCheck {
    if !info.has_audio {
        return AudioCheck::NoAudio;
    }
    if info.audio_sample_rate == Some(TARGET_SAMPLE_RATE)
        && info.audio_channels == Some(TARGET_CHANNELS)
    {
        AudioCheck::AlreadyNormalized
    } else {
        AudioCheck::NeedsResample
    }
}

pub fn build_normalize_command(ffmpeg: &Path, input: &Path, output: &Path) -> FfmpegCommand {
    FfmpegCommand::new(ffmpeg)
        .input(input)
        .args(["-c:v", "copy", "-c:a", "aac"])
        .args(["-ar".to_owned(), TARGET_SAMPLE_RATE.to_string()])
        .args(["-ac".to_owned(), TARGET_CHANNELS.to_string()])
        .output(output)
}

/// Resamples the audio of every `.mp4` directly in `dir` to 48 kHz mono, in place.
pub fn normalize_dir(tools: &Tools, config: &Config, dir: &Path) -> Result<BatchReport> {
    let skip = SkipPattern::new(&config.walk.skip_dir_pattern);
    let mut report = BatchReport::new("normalize-audio");

    for video in files_with_extension(dir, &["mp4"], false, &skip)? {
        let info = match media_info(&tools.ffprobe, &video) {
            Ok(info) => info,
            Err(error) => {
                report.failed(&video, &error);
                continue;
            }
        };
        match check_audio(&info) {
            AudioCheck::NoAudio => report.skipped(&video, "no audio stream"),
            AudioCheck::AlreadyNormalized => report.skipped(&video, "already 48000 Hz mono"),
            AudioCheck::NeedsResample => match normalize_file(tools, &video) {
                Ok(()) => report.ok(
                    &video,
                    format!(
                        "{} Hz x{} -> 48000 Hz mono",
                        info.audio_sample_rate.unwrap_or_default(),
                        info.audio_channels.unwrap_or_default()
                    ),
                ),
                Err(error) => report.failed(&video, &error),
            },
        }
    }

    Ok(report)
}

fn normalize_file(tools: &Tools, video: &Path) -> Result<()> {
    let temp = sibling_temp_path(video)?;
    build_normalize_command(&tools.ffmpeg, video, &temp)
        .run()
        .with_context(|| format!("failed to resample audio of {}", video.display()))?;
    persist_over(temp, video)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{build_normalize_command, check_audio, AudioCheck};
    use crate::probe::MediaInfo;

    fn info(has_audio: bool, rate: Option<u32>, channels: Option<u32>) -> MediaInfo {
        MediaInfo {
            duration_seconds: Some(3.0),
            width: Some(1920),
            height: Some(1080),
            fps: Some(30.0),
            frames: Some(90),
            has_video: true,
            has_audio,
            audio_sample_rate: rate,
            audio_channels: channels,
        }
    }

    #[test]
    fn classifies_audio_streams() {
        assert_eq!(check_audio(&info(false, None, None)), AudioCheck::NoAudio);
        assert_eq!(
            check_audio(&info(true, Some(48_000), Some(1))),
            AudioCheck::AlreadyNormalized
        );
        assert_eq!(
            check_audio(&info(true, Some(48_000), Some(2))),
            AudioCheck::NeedsResample
        );
        assert_eq!(
            check_audio(&info(true, Some(44_100), Some(1))),
            AudioCheck::NeedsResample
        );
    }

    #[test]
    fn remux_copies_video() {
        let args = build_normalize_command(Path::new("ffmpeg"), Path::new("a.mp4"), Path::new("b.mp4"))
            .to_args()
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(
            args,
            "-hide_banner -y -i a.mp4 -c:v copy -c:a aac -ar 48000 -ac 1 b.mp4"
        );
    }
}
