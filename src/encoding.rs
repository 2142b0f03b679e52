use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};

use crate::config::EncodeConfig;
use crate::ffmpeg::{last_n_chars, spawn_error};

/// Geometry and codec settings for a raw RGBA to H.264 encode. The output always
/// carries a silent AAC track so it concatenates with clips that have audio.
#[derive(Debug, Clone)]
pub struct PipeSpec {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub encode: EncodeConfig,
}

impl PipeSpec {
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// Streams frames to an ffmpeg child on a worker thread through a bounded channel.
pub struct FfmpegPipe {
    sender: Option<mpsc::SyncSender<Vec<u8>>>,
    worker: Option<JoinHandle<Result<()>>>,
    frame_len: usize,
}

impl FfmpegPipe {
    pub fn spawn(ffmpeg: &Path, spec: &PipeSpec, output_path: &Path) -> Result<Self> {
        let args = ffmpeg_args(spec, output_path)?;
        let ffmpeg = ffmpeg.to_path_buf();
        let (sender, receiver) = mpsc::sync_channel::<Vec<u8>>(4);

        let worker = thread::Builder::new()
            .name("clipbatch-ffmpeg-encoder".to_owned())
            .spawn(move || run_ffmpeg_process(ffmpeg, args, receiver))
            .context("failed to spawn ffmpeg writer thread")?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            frame_len: spec.frame_len(),
        })
    }

    pub fn write_frame(&self, rgba_frame: Vec<u8>) -> Result<()> {
        if rgba_frame.len() != self.frame_len {
            bail!(
                "frame has {} bytes, expected {}",
                rgba_frame.len(),
                self.frame_len
            );
        }
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("encoder has already been finalized"))?;
        sender
            .send(rgba_frame)
            .map_err(|_| anyhow!("failed to enqueue frame for ffmpeg"))
    }

    pub fn finish(mut self) -> Result<()> {
        drop(self.sender.take());

        let handle = self
            .worker
            .take()
            .ok_or_else(|| anyhow!("ffmpeg worker thread missing"))?;
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(anyhow!("ffmpeg worker thread panicked")),
        }
    }
}

fn run_ffmpeg_process(
    ffmpeg: PathBuf,
    args: Vec<String>,
    receiver: mpsc::Receiver<Vec<u8>>,
) -> Result<()> {
    let mut child = Command::new(&ffmpeg)
        .args(args.iter().map(String::as_str))
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| spawn_error(&ffmpeg, error, &args.join(" ")))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("failed to capture ffmpeg stdin"))?;
    let mut stderr_pipe = child.stderr.take();

    let mut write_error = None;
    while let Ok(frame) = receiver.recv() {
        if let Err(error) = stdin.write_all(&frame) {
            write_error = Some(error);
            break;
        }
    }
    // Further sends fail instead of blocking once the encoder is gone.
    drop(receiver);
    if write_error.is_none() {
        stdin.flush().context("failed to flush ffmpeg stdin")?;
    }
    drop(stdin);

    let status = child.wait().context("failed waiting for ffmpeg process")?;
    let stderr_tail = read_stderr_tail(&mut stderr_pipe)?;
    if !status.success() {
        return Err(anyhow!(
            "ffmpeg failed with status {status} (resolved_path={}, args='{}', stderr_tail='{}')",
            ffmpeg.display(),
            args.join(" "),
            stderr_tail
        ));
    }
    if let Some(error) = write_error {
        return Err(anyhow!(error).context("failed to write frame to ffmpeg stdin"));
    }
    Ok(())
}

fn ffmpeg_args(spec: &PipeSpec, output_path: &Path) -> Result<Vec<String>> {
    let path_str = output_path.to_string_lossy();
    if path_str.chars().any(|c| c.is_control()) {
        bail!("output path contains control characters");
    }

    let mut args = rawvideo_input_args(spec.width, spec.height, spec.fps);
    args.extend(
        ["-f", "lavfi", "-i", "anullsrc=r=48000:cl=stereo"]
            .into_iter()
            .map(str::to_owned),
    );
    args.extend(h264_output_args(spec));
    args.push(path_str.into_owned());
    Ok(args)
}

fn rawvideo_input_args(width: u32, height: u32, fps: u32) -> Vec<String> {
    vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-y".to_owned(),
        "-f".to_owned(),
        "rawvideo".to_owned(),
        "-pix_fmt".to_owned(),
        "rgba".to_owned(),
        "-s:v".to_owned(),
        format!("{width}x{height}"),
        "-r".to_owned(),
        fps.to_string(),
        "-i".to_owned(),
        "-".to_owned(),
    ]
}

fn h264_output_args(spec: &PipeSpec) -> Vec<String> {
    vec![
        "-map".to_owned(),
        "0:v".to_owned(),
        "-c:v".to_owned(),
        spec.encode.video_codec.clone(),
        "-preset".to_owned(),
        spec.encode.preset.clone(),
        "-crf".to_owned(),
        spec.encode.crf.to_string(),
        "-pix_fmt".to_owned(),
        "yuv420p".to_owned(),
        "-map".to_owned(),
        "1:a".to_owned(),
        "-c:a".to_owned(),
        spec.encode.audio_codec.clone(),
        "-b:a".to_owned(),
        spec.encode.audio_bitrate.clone(),
        "-shortest".to_owned(),
        "-movflags".to_owned(),
        "+faststart".to_owned(),
    ]
}

fn read_stderr_tail(stderr: &mut Option<std::process::ChildStderr>) -> Result<String> {
    let Some(mut pipe) = stderr.take() else {
        return Ok(String::new());
    };
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf)
        .context("failed reading ffmpeg stderr")?;
    Ok(last_n_chars(&String::from_utf8_lossy(&buf), 500))
}
