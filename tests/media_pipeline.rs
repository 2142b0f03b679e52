use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

use serde_json::{json, Value};
use tempfile::tempdir;

fn command_available(name: &str) -> bool {
    Command::new(name)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn media_tools_available() -> bool {
    command_available("ffmpeg") && command_available("ffprobe")
}

fn run_clipbatch(cwd: &Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_clipbatch"))
        .current_dir(cwd)
        .args(args)
        .output()
        .expect("clipbatch command should run")
}

fn make_clip(path: &Path, seconds: f64, with_audio: bool, sample_rate: u32, channels: u32) {
    let duration = format!("{seconds}");
    let layout = if channels == 1 { "mono" } else { "stereo" };
    let audio_source = format!("anullsrc=r={sample_rate}:cl={layout}");
    let mut args = vec![
        "-hide_banner",
        "-loglevel",
        "error",
        "-y",
        "-f",
        "lavfi",
        "-t",
        duration.as_str(),
        "-i",
        "testsrc=size=160x90:rate=25",
    ];
    if with_audio {
        args.extend(["-f", "lavfi", "-t", duration.as_str(), "-i", audio_source.as_str()]);
        args.extend(["-c:a", "aac", "-shortest"]);
    }
    args.extend(["-c:v", "libx264", "-pix_fmt", "yuv420p"]);
    let status = Command::new("ffmpeg")
        .args(&args)
        .arg(path)
        .status()
        .expect("ffmpeg should run");
    assert!(status.success(), "test clip should encode");
}

fn probe_duration(path: &Path) -> f64 {
    let output = Command::new("ffprobe")
        .args(["-v", "error", "-show_entries", "format=duration", "-of", "csv=p=0"])
        .arg(path)
        .output()
        .expect("ffprobe should run");
    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .expect("duration should parse")
}

#[test]
fn merge_drops_bad_clips_and_rewrites_manifest() {
    if !media_tools_available() {
        eprintln!("skipping: ffmpeg/ffprobe not installed");
        return;
    }

    let dir = tempdir().expect("tempdir should create");
    let project = dir.path().join("project");
    fs::create_dir(&project).expect("project should create");
    make_clip(&project.join("a.mp4"), 1.0, true, 48_000, 2);
    make_clip(&project.join("b.mp4"), 1.0, false, 48_000, 2);
    fs::write(project.join("broken.mp4"), b"definitely not video").expect("clip should write");
    fs::write(
        project.join("global_props.json"),
        serde_json::to_vec_pretty(&json!({
            "order": ["a.mp4", "missing.mp4", "b.mp4", "broken.mp4"],
            "error_clips": [{"clip": "old.mp4", "error": "earlier run"}],
            "title": "Site Safety",
            "producer": "kept as-is"
        }))
        .expect("manifest should serialize"),
    )
    .expect("manifest should write");

    let output = run_clipbatch(dir.path(), &["merge", "."]);
    assert!(
        output.status.success(),
        "merge should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let merged = project.join("output.mp4");
    assert!(merged.is_file());
    assert!((probe_duration(&merged) - 2.0).abs() < 0.3);

    let manifest: Value = serde_json::from_str(
        &fs::read_to_string(project.join("global_props.json")).expect("manifest should exist"),
    )
    .expect("manifest should parse");
    assert_eq!(manifest["order"], json!(["a.mp4", "b.mp4"]));
    let dropped = manifest["error_clips"]
        .as_array()
        .expect("error_clips should be an array")
        .iter()
        .map(|entry| entry["clip"].as_str().unwrap_or_default().to_owned())
        .collect::<Vec<_>>();
    assert_eq!(dropped, ["old.mp4", "missing.mp4", "broken.mp4"]);
    assert_eq!(manifest["producer"], "kept as-is");

    let leftovers = fs::read_dir(&project)
        .expect("project should be readable")
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(".clipbatch-"))
        .count();
    assert_eq!(leftovers, 0);
}

#[test]
fn dry_run_writes_nothing() {
    if !media_tools_available() {
        eprintln!("skipping: ffmpeg/ffprobe not installed");
        return;
    }

    let dir = tempdir().expect("tempdir should create");
    make_clip(&dir.path().join("a.mp4"), 1.0, true, 48_000, 2);
    let manifest = r#"{"order": ["a.mp4", "gone.mp4"]}"#;
    fs::write(dir.path().join("global_props.json"), manifest).expect("manifest should write");

    let output = run_clipbatch(dir.path(), &["merge", ".", "--dry-run"]);
    assert!(output.status.success());
    assert!(!dir.path().join("output.mp4").exists());
    assert_eq!(
        fs::read_to_string(dir.path().join("global_props.json")).expect("manifest should exist"),
        manifest
    );
}

#[test]
fn normalize_audio_resamples_only_when_needed() {
    if !media_tools_available() {
        eprintln!("skipping: ffmpeg/ffprobe not installed");
        return;
    }

    let dir = tempdir().expect("tempdir should create");
    make_clip(&dir.path().join("a_stereo.mp4"), 1.0, true, 44_100, 2);
    make_clip(&dir.path().join("b_mono.mp4"), 1.0, true, 48_000, 1);
    make_clip(&dir.path().join("c_silent.mp4"), 1.0, false, 48_000, 1);

    let output = run_clipbatch(dir.path(), &["--json", "normalize-audio", "."]);
    assert!(output.status.success());
    let report: Value = serde_json::from_slice(&output.stdout).expect("report should parse");
    let statuses = report["items"]
        .as_array()
        .expect("items should be an array")
        .iter()
        .map(|item| item["status"].as_str().unwrap_or_default().to_owned())
        .collect::<Vec<_>>();
    assert_eq!(statuses, ["ok", "skipped", "skipped"]);

    let probe = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "a:0",
            "-show_entries",
            "stream=sample_rate,channels",
            "-of",
            "csv=p=0",
        ])
        .arg(dir.path().join("a_stereo.mp4"))
        .output()
        .expect("ffprobe should run");
    assert_eq!(String::from_utf8_lossy(&probe.stdout).trim(), "48000,1");
}

#[test]
fn intro_still_writes_png_and_leaves_manifest_alone() {
    let font = Path::new("/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf");
    if !media_tools_available() || !font.is_file() {
        eprintln!("skipping: ffmpeg/ffprobe or DejaVuSans not installed");
        return;
    }

    let dir = tempdir().expect("tempdir should create");
    make_clip(&dir.path().join("a.mp4"), 2.0, true, 48_000, 2);
    make_clip(&dir.path().join("b.mp4"), 1.0, true, 48_000, 2);
    let manifest =
        r#"{"order": ["a.mp4", "b.mp4"], "title": "Conveyor Basics", "subtitle": "Module 1"}"#;
    fs::write(dir.path().join("global_props.json"), manifest).expect("manifest should write");
    fs::write(
        dir.path().join("clipbatch.yaml"),
        format!("intro:\n  font_path: {}\n", font.display()),
    )
    .expect("config should write");

    let output = run_clipbatch(dir.path(), &["intro", ".", "--still", "final.png"]);
    assert!(
        output.status.success(),
        "intro should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(dir.path().join("final.png").is_file());

    assert_eq!(
        fs::read_to_string(dir.path().join("global_props.json")).expect("manifest should exist"),
        manifest
    );
}
