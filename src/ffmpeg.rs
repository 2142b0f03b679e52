use std::ffi::OsString;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use regex::Regex;

use crate::config::ToolsConfig;

const STDERR_TAIL_CHARS: usize = 500;

/// Resolved ffmpeg and ffprobe binaries.
#[derive(Debug, Clone)]
pub struct Tools {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Tools {
    pub fn resolve(config: &ToolsConfig) -> Result<Self> {
        let tools = Self {
            ffmpeg: config.ffmpeg()?,
            ffprobe: config.ffprobe()?,
        };
        tracing::debug!(
            ffmpeg = %tools.ffmpeg.display(),
            ffprobe = %tools.ffprobe.display(),
            "resolved media tools"
        );
        Ok(tools)
    }
}

/// Argument builder for one ffmpeg invocation. Always overwrites its output.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    program: PathBuf,
    args: Vec<OsString>,
    output: Option<PathBuf>,
}

impl FfmpegCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec!["-hide_banner".into(), "-y".into()],
            output: None,
        }
    }

    pub fn input(mut self, path: &Path) -> Self {
        self.args.push("-i".into());
        self.args.push(path.as_os_str().to_owned());
        self
    }

    /// Adds a lavfi source input such as `anullsrc=r=48000:cl=mono`, limited to `duration` seconds.
    pub fn lavfi_input(mut self, source: &str, duration: f64) -> Self {
        self.args.extend(
            ["-f", "lavfi", "-t", &format!("{duration:.3}"), "-i", source]
                .into_iter()
                .map(OsString::from),
        );
        self
    }

    pub fn filter_complex(mut self, graph: &str) -> Self {
        self.args.push("-filter_complex".into());
        self.args.push(graph.into());
        self
    }

    pub fn map(mut self, label: &str) -> Self {
        self.args.push("-map".into());
        self.args.push(label.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn output(mut self, path: &Path) -> Self {
        self.output = Some(path.to_path_buf());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn to_args(&self) -> Vec<OsString> {
        let mut args = self.args.clone();
        if let Some(output) = &self.output {
            args.push(output.as_os_str().to_owned());
        }
        args
    }

    fn display_args(&self) -> String {
        self.to_args()
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn run(&self) -> Result<()> {
        tracing::debug!(program = %self.program.display(), args = %self.display_args(), "running ffmpeg");
        let output = Command::new(&self.program)
            .args(self.to_args())
            .stdin(Stdio::null())
            .output()
            .map_err(|error| spawn_error(&self.program, error, &self.display_args()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "ffmpeg failed with status {} (resolved_path={}, args='{}', stderr_tail='{}')",
                output.status,
                self.program.display(),
                self.display_args(),
                last_n_chars(&stderr, STDERR_TAIL_CHARS)
            ));
        }
        Ok(())
    }

    /// Runs ffmpeg and reports encode progress in percent, parsed from its `frame=` status lines.
    pub fn run_with_progress(
        &self,
        total_frames: Option<u64>,
        mut on_progress: impl FnMut(f64),
    ) -> Result<()> {
        tracing::debug!(program = %self.program.display(), args = %self.display_args(), "running ffmpeg");
        let mut child: Child = Command::new(&self.program)
            .args(self.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| spawn_error(&self.program, error, &self.display_args()))?;

        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("failed to capture ffmpeg stderr"))?;

        let mut tail = String::new();
        let mut line = Vec::new();
        let mut buffer = [0_u8; 4096];
        loop {
            let read = stderr
                .read(&mut buffer)
                .context("failed reading ffmpeg stderr")?;
            if read == 0 {
                break;
            }
            for &byte in &buffer[..read] {
                if byte == b'\r' || byte == b'\n' {
                    let text = String::from_utf8_lossy(&line).into_owned();
                    report_progress(&text, total_frames, &mut on_progress);
                    push_tail(&mut tail, &text);
                    line.clear();
                } else {
                    line.push(byte);
                }
            }
        }
        if !line.is_empty() {
            let text = String::from_utf8_lossy(&line).into_owned();
            report_progress(&text, total_frames, &mut on_progress);
            push_tail(&mut tail, &text);
        }

        let status = child.wait().context("failed waiting for ffmpeg process")?;
        if !status.success() {
            return Err(anyhow!(
                "ffmpeg failed with status {status} (resolved_path={}, args='{}', stderr_tail='{}')",
                self.program.display(),
                self.display_args(),
                last_n_chars(&tail, STDERR_TAIL_CHARS)
            ));
        }
        Ok(())
    }
}

fn report_progress(line: &str, total_frames: Option<u64>, on_progress: &mut impl FnMut(f64)) {
    let (Some(total), Some(frame)) = (total_frames.filter(|total| *total > 0), parse_frame(line))
    else {
        return;
    };
    let percent = (frame as f64 / total as f64 * 100.0).min(100.0);
    on_progress(percent);
}

/// Current frame number from an ffmpeg status line.
pub fn parse_frame(line: &str) -> Option<u64> {
    static FRAME: OnceLock<Regex> = OnceLock::new();
    let frame = FRAME
        .get_or_init(|| Regex::new(r"frame=\s*(\d+)").expect("frame regex should compile"));
    frame
        .captures(line)
        .and_then(|captures| captures.get(1))
        .and_then(|value| value.as_str().parse().ok())
}

fn push_tail(tail: &mut String, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    tail.push_str(line);
    tail.push('\n');
    if tail.len() > STDERR_TAIL_CHARS * 4 {
        *tail = last_n_chars(tail, STDERR_TAIL_CHARS * 2);
        tail.push('\n');
    }
}

pub(crate) fn spawn_error(program: &Path, error: std::io::Error, args: &str) -> anyhow::Error {
    let name = program
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ffmpeg".to_owned());
    if error.kind() == ErrorKind::NotFound {
        anyhow!(
            "{name} executable not found (resolved_path={}). Install ffmpeg, set tools.{name} in clipbatch.yaml, or build with `--features sidecar_ffmpeg`.",
            program.display()
        )
    } else {
        anyhow!(
            "failed to spawn {name} process (resolved_path={}, args='{args}'): {error}",
            program.display()
        )
    }
}

pub(crate) fn last_n_chars(s: &str, max_chars: usize) -> String {
    let chars = s.chars().collect::<Vec<_>>();
    let start = chars.len().saturating_sub(max_chars);
    chars[start..].iter().collect::<String>().trim().to_owned()
}


/// Shell-script stand-ins for ffmpeg and ffprobe so folder flows run without the real
/// binaries. Scripts see the same argument lists as the real tools.
#[cfg(all(test, unix))]
pub(crate) mod fake_tools {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    use super::Tools;

    /// Writes its last argument (the output path) and succeeds.
    pub const FFMPEG_WRITES_OUTPUT: &str =
        "for arg in \"$@\"; do last=\"$arg\"; done\nprintf 'encoded' > \"$last\"\n";
    pub const FFMPEG_FAILS: &str = "echo 'Conversion failed!' >&2\nexit 1\n";

    /// Every probed file is a 25-packet clip of `duration` seconds with video and audio.
    pub fn ffprobe_clip(duration: f64) -> String {
        format!(
            r#"case "$*" in
  *-count_packets*) echo 25 ;;
  *-print_format*) echo '{{"streams":[{{"codec_type":"video","width":160,"height":90,"r_frame_rate":"25/1"}},{{"codec_type":"audio","sample_rate":"48000","channels":2}}],"format":{{"duration":"{duration}"}}}}' ;;
  *format=duration*) echo {duration} ;;
  *) exit 1 ;;
esac
"#
        )
    }

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}")).expect("script should be written");
        let mut perms = fs::metadata(&path)
            .expect("script metadata should be readable")
            .permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("script should become executable");
        path
    }

    pub fn install(dir: &Path, ffmpeg: &str, ffprobe: &str) -> Tools {
        fs::create_dir_all(dir).expect("tool dir should be created");
        Tools {
            ffmpeg: script(dir, "ffmpeg", ffmpeg),
            ffprobe: script(dir, "ffprobe", ffprobe),
        }
    }
}
