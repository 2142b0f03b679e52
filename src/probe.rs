use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use crate::ffmpeg::{last_n_chars, spawn_error};

/// Stream-level facts about a media file, as reported by `ffprobe -show_streams -show_format`.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub duration_seconds: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub frames: Option<u64>,
    pub has_video: bool,
    pub has_audio: bool,
    pub audio_sample_rate: Option<u32>,
    pub audio_channels: Option<u32>,
}

impl MediaInfo {
    /// Frame count, estimated from duration and rate when the container does not store one.
    pub fn frame_count(&self) -> Option<u64> {
        self.frames.or_else(|| {
            let duration = self.duration_seconds?;
            let fps = self.fps?;
            Some((duration * fps).round().max(1.0) as u64)
        })
    }
}

/// Decodes the packet index of the first video stream. A clip passes only when ffprobe
/// succeeds and counts at least one packet.
pub fn verify_clip(ffprobe: &Path, path: &Path) -> Result<u64> {
    if !path.is_file() {
        bail!("clip does not exist: {}", path.display());
    }

    let stdout = run_ffprobe(
        ffprobe,
        &[
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-count_packets",
            "-show_entries",
            "stream=nb_read_packets",
            "-of",
            "csv=p=0",
        ],
        path,
    )?;

    let packets = stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.trim_end_matches(',').parse::<u64>().ok())
        .ok_or_else(|| anyhow!("ffprobe reported no video packets for {}", path.display()))?;
    if packets == 0 {
        bail!("video stream of {} has no packets", path.display());
    }
    Ok(packets)
}

pub fn media_info(ffprobe: &Path, path: &Path) -> Result<MediaInfo> {
    #[derive(Debug, Deserialize)]
    struct FfprobeOutput {
        #[serde(default)]
        streams: Vec<FfprobeStream>,
        #[serde(default)]
        format: Option<FfprobeFormat>,
    }

    #[derive(Debug, Deserialize)]
    struct FfprobeStream {
        #[serde(default)]
        codec_type: Option<String>,
        #[serde(default)]
        width: Option<u32>,
        #[serde(default)]
        height: Option<u32>,
        #[serde(default)]
        r_frame_rate: Option<String>,
        #[serde(default)]
        avg_frame_rate: Option<String>,
        #[serde(default)]
        nb_frames: Option<String>,
        #[serde(default)]
        duration: Option<String>,
        #[serde(default)]
        sample_rate: Option<String>,
        #[serde(default)]
        channels: Option<u32>,
    }

    #[derive(Debug, Deserialize)]
    struct FfprobeFormat {
        #[serde(default)]
        duration: Option<String>,
    }

    let stdout = run_ffprobe(
        ffprobe,
        &[
            "-v",
            "error",
            "-show_streams",
            "-show_format",
            "-print_format",
            "json",
        ],
        path,
    )?;
    let parsed: FfprobeOutput = serde_json::from_str(&stdout)
        .with_context(|| format!("failed to parse ffprobe JSON for {}", path.display()))?;

    let video = parsed
        .streams
        .iter()
        .find(|stream| stream.codec_type.as_deref() == Some("video"));
    let audio = parsed
        .streams
        .iter()
        .find(|stream| stream.codec_type.as_deref() == Some("audio"));

    let fps = video.and_then(|stream| {
        stream
            .r_frame_rate
            .as_deref()
            .and_then(parse_ffprobe_rate)
            .or_else(|| stream.avg_frame_rate.as_deref().and_then(parse_ffprobe_rate))
    });
    let duration_seconds = parsed
        .format
        .as_ref()
        .and_then(|format| format.duration.as_deref())
        .and_then(parse_ffprobe_float)
        .or_else(|| {
            video
                .and_then(|stream| stream.duration.as_deref())
                .and_then(parse_ffprobe_float)
        });

    Ok(MediaInfo {
        duration_seconds,
        width: video.and_then(|stream| stream.width),
        height: video.and_then(|stream| stream.height),
        fps,
        frames: video
            .and_then(|stream| stream.nb_frames.as_deref())
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .filter(|frames| *frames > 0),
        has_video: video.is_some(),
        has_audio: audio.is_some(),
        audio_sample_rate: audio
            .and_then(|stream| stream.sample_rate.as_deref())
            .and_then(|raw| raw.trim().parse::<u32>().ok()),
        audio_channels: audio.and_then(|stream| stream.channels),
    })
}

/// Container duration in seconds.
pub fn duration_seconds(ffprobe: &Path, path: &Path) -> Result<f64> {
    let stdout = run_ffprobe(
        ffprobe,
        &[
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ],
        path,
    )?;
    stdout
        .lines()
        .find_map(parse_ffprobe_float)
        .ok_or_else(|| anyhow!("ffprobe reported no duration for {}", path.display()))
}

fn run_ffprobe(ffprobe: &Path, args: &[&str], path: &Path) -> Result<String> {
    let output = Command::new(ffprobe)
        .args(args)
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .map_err(|error| spawn_error(ffprobe, error, &args.join(" ")))
        .with_context(|| format!("failed to probe {}", path.display()))?;

    if !output.status.success() {
        bail!(
            "ffprobe failed for {} (exit status: {}, stderr_tail='{}')",
            path.display(),
            output.status,
            last_n_chars(&String::from_utf8_lossy(&output.stderr), 300)
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parses `30000/1001` style rates by dividing, never by evaluating.
pub fn parse_ffprobe_rate(raw: &str) -> Option<f64> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }
    if let Some((numerator, denominator)) = value.split_once('/') {
        let numerator = numerator.trim().parse::<f64>().ok()?;
        let denominator = denominator.trim().parse::<f64>().ok()?;
        if denominator.abs() <= f64::EPSILON {
            return None;
        }
        let result = numerator / denominator;
        return (result.is_finite() && result > 0.0).then_some(result);
    }

    let parsed = value.parse::<f64>().ok()?;
    (parsed.is_finite() && parsed > 0.0).then_some(parsed)
}

fn parse_ffprobe_float(raw: &str) -> Option<f64> {
    let parsed = raw.trim().parse::<f64>().ok()?;
    (parsed.is_finite() && parsed > 0.0).then_some(parsed)
}
