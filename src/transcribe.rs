use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;

use crate::atomic::{persist_over, sibling_temp_path, write_atomic};
use crate::config::{api_key, Config, TranscriptionConfig};
use crate::ffmpeg::{FfmpegCommand, Tools};
use crate::http::{build_client, ensure_success};
use crate::manifest::ClipMetadata;
use crate::probe::duration_seconds;
use crate::report::BatchReport;
use crate::walk::{files_with_extension, has_extension, stem, SkipPattern};

const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "mov", "m4v", "mkv"];

/// Client for Whisper-compatible `/audio/transcriptions` endpoints.
#[derive(Debug, Clone)]
pub struct TranscriptionClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl TranscriptionClient {
    pub fn new(http: Client, base_url: &str, api_key: String, model: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
            model: model.to_owned(),
        }
    }

    pub fn from_config(config: &TranscriptionConfig) -> Result<Self> {
        let key = api_key(&config.api_key_env)?;
        Ok(Self::new(
            build_client(config.timeout_secs)?,
            &config.base_url,
            key,
            &config.model,
        ))
    }

    pub async fn transcribe(&self, audio: &Path) -> Result<String> {
        let bytes = tokio::fs::read(audio)
            .await
            .with_context(|| format!("failed to read {}", audio.display()))?;
        let file_name = audio
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.mp3".to_owned());
        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime_for(audio))
            .context("invalid audio mime type")?;
        let form = Form::new()
            .part("file", part)
            .text("model", self.model.clone());

        let response = self
            .http
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("failed to call transcription API for {}", audio.display()))?;
        let parsed: TranscriptionResponse = ensure_success(response, "transcription API")
            .await?
            .json()
            .await
            .context("failed to decode transcription response")?;
        Ok(parsed.text.trim().to_owned())
    }
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "wav" => "audio/wav",
        "m4a" => "audio/mp4",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "audio/mpeg",
    }
}

pub fn transcript_path(media: &Path) -> Result<PathBuf> {
    let stem = stem(media)?;
    Ok(media.with_file_name(format!("{stem}_transcript.txt")))
}

/// Extracts the audio of `video` to a sibling `.mp3`, reusing an existing one.
pub fn extract_audio(tools: &Tools, video: &Path) -> Result<PathBuf> {
    let audio = video.with_extension("mp3");
    if audio.exists() {
        return Ok(audio);
    }
    let temp = sibling_temp_path(&audio)?;
    FfmpegCommand::new(&tools.ffmpeg)
        .input(video)
        .args(["-vn", "-c:a", "libmp3lame", "-q:a", "2"])
        .output(&temp)
        .run()
        .with_context(|| format!("failed to extract audio from {}", video.display()))?;
    persist_over(temp, &audio)?;
    Ok(audio)
}

/// Outcome for one media file; `None` means it already had a transcript.
pub async fn transcribe_file(
    tools: &Tools,
    client: &TranscriptionClient,
    media: &Path,
) -> Result<Option<PathBuf>> {
    let transcript = transcript_path(media)?;
    if transcript.exists() {
        return Ok(None);
    }

    let audio = if has_extension(media, &VIDEO_EXTENSIONS) {
        extract_audio(tools, media)?
    } else {
        media.to_path_buf()
    };

    let text = client.transcribe(&audio).await?;
    write_atomic(&transcript, text.as_bytes())?;

    let sidecar_path = ClipMetadata::sidecar_path(media);
    let mut metadata = ClipMetadata::load_or_new(&sidecar_path, &stem(media)?)?;
    metadata.push_transcript(&text);
    metadata.duration = match duration_seconds(&tools.ffprobe, media) {
        Ok(duration) => Some(duration),
        Err(error) => {
            tracing::warn!(path = %media.display(), "could not read duration: {error:#}");
            None
        }
    };
    metadata.save(&sidecar_path)?;
    Ok(Some(transcript))
}

pub async fn transcribe_tree(
    tools: &Tools,
    config: &Config,
    client: &TranscriptionClient,
    root: &Path,
) -> Result<BatchReport> {
    let skip = SkipPattern::new(&config.walk.skip_dir_pattern);
    let extensions = config
        .transcription
        .extensions
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>();
    let mut report = BatchReport::new("transcribe");

    for media in files_with_extension(root, &extensions, true, &skip)? {
        match transcribe_file(tools, client, &media).await {
            Ok(Some(transcript)) => report.ok(&media, transcript.display().to_string()),
            Ok(None) => report.skipped(&media, "transcript exists"),
            Err(error) => report.failed(&media, &error),
        }
    }

    Ok(report)
}

/// Records the duration of every `.mp4` below `root` in its sidecar.
pub fn durations_tree(tools: &Tools, config: &Config, root: &Path) -> Result<BatchReport> {
    let skip = SkipPattern::new(&config.walk.skip_dir_pattern);
    let mut report = BatchReport::new("durations");

    for media in files_with_extension(root, &["mp4"], true, &skip)? {
        let duration = match duration_seconds(&tools.ffprobe, &media) {
            Ok(duration) => duration,
            Err(error) => {
                report.skipped(&media, format!("{error:#}"));
                continue;
            }
        };
        let sidecar_path = ClipMetadata::sidecar_path(&media);
        let result = stem(&media)
            .and_then(|label| ClipMetadata::load_or_new(&sidecar_path, &label))
            .and_then(|mut metadata| {
                metadata.duration = Some(duration);
                metadata.save(&sidecar_path)
            });
        match result {
            Ok(()) => report.ok(&media, format!("{duration:.2}s")),
            Err(error) => report.failed(&media, &error),
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use serde_json::Value;
    use tempfile::tempdir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{transcribe_file, transcript_path, TranscriptionClient};
    use crate::ffmpeg::Tools;
    use crate::http::build_client;

    fn tools() -> Tools {
        Tools {
            ffmpeg: PathBuf::from("/nonexistent/ffmpeg"),
            ffprobe: PathBuf::from("/nonexistent/ffprobe"),
        }
    }

    #[test]
    fn transcript_sits_next_to_media() {
        assert_eq!(
            transcript_path(Path::new("/work/day1/0003.mp3")).expect("path should build"),
            PathBuf::from("/work/day1/0003_transcript.txt")
        );
    }

    #[tokio::test]
    async fn transcribes_and_writes_sidecar() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/audio/transcriptions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"text": " Welcome to the site. "})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().expect("tempdir should be created");
        let audio = dir.path().join("0001.mp3");
        fs::write(&audio, b"ID3 fake audio").expect("audio should be written");

        let client = TranscriptionClient::new(
            build_client(10).expect("client should build"),
            &format!("{}/v1/", server.uri()),
            "test-key".to_owned(),
            "whisper-1",
        );
        let written = transcribe_file(&tools(), &client, &audio)
            .await
            .expect("transcription should succeed")
            .expect("transcript should be written");

        assert_eq!(
            fs::read_to_string(&written).expect("transcript should be readable"),
            "Welcome to the site."
        );
        let sidecar: Value = serde_json::from_str(
            &fs::read_to_string(dir.path().join("0001.json")).expect("sidecar should exist"),
        )
        .expect("sidecar should be json");
        assert_eq!(sidecar["label"], "0001");
        assert_eq!(sidecar["transcript"][0]["text"], "Welcome to the site.");
        assert_eq!(sidecar["duration"], Value::Null);

        // A second pass sees the transcript and never calls the API again.
        let again = transcribe_file(&tools(), &client, &audio)
            .await
            .expect("second pass should succeed");
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn api_errors_surface_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .mount(&server)
            .await;

        let dir = tempdir().expect("tempdir should be created");
        let audio = dir.path().join("0002.mp3");
        fs::write(&audio, b"fake").expect("audio should be written");
        let client = TranscriptionClient::new(
            build_client(10).expect("client should build"),
            &server.uri(),
            "bad".to_owned(),
            "whisper-1",
        );
        let error = transcribe_file(&tools(), &client, &audio)
            .await
            .expect_err("401 should fail");
        assert!(format!("{error:#}").contains("invalid api key"));
        assert!(!dir.path().join("0002_transcript.txt").exists());
    }
}
