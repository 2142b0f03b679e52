use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::atomic::write_atomic;
use crate::config::{api_key, Config, TtsConfig, TtsProviderConfig, TtsProviderKind};
use crate::error_codes::{CodedError, UNKNOWN_TTS_PROVIDER};
use crate::ffmpeg::last_n_chars;
use crate::http::{build_client, ensure_success};
use crate::report::BatchReport;
use crate::slides::{clean_filename, load_slides, slides_output_dir, SlideField};
use crate::walk::{files_with_extension, SkipPattern};

/// The provider refused the request because the account's character quota is used up.
/// Retrying other items cannot succeed, so batches stop on it.
#[derive(Debug, Clone)]
pub struct CharacterLimitError {
    pub message: String,
}

impl fmt::Display for CharacterLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TTS character limit reached: {}", self.message)
    }
}

impl std::error::Error for CharacterLimitError {}

pub fn is_character_limit(error: &anyhow::Error) -> bool {
    error
        .chain()
        .any(|cause| cause.downcast_ref::<CharacterLimitError>().is_some())
}

/// Invisible format characters (soft hyphen, zero-width and bidi marks, BOM, tag
/// characters) and private-use code points.
fn is_format_or_private(c: char) -> bool {
    matches!(
        c,
        '\u{AD}'
            | '\u{600}'..='\u{605}'
            | '\u{61C}'
            | '\u{6DD}'
            | '\u{70F}'
            | '\u{180E}'
            | '\u{200B}'..='\u{200F}'
            | '\u{202A}'..='\u{202E}'
            | '\u{2060}'..='\u{2064}'
            | '\u{2066}'..='\u{206F}'
            | '\u{FEFF}'
            | '\u{FFF9}'..='\u{FFFB}'
            | '\u{E000}'..='\u{F8FF}'
            | '\u{110BD}'
            | '\u{1D173}'..='\u{1D17A}'
            | '\u{E0001}'
            | '\u{E0020}'..='\u{E007F}'
            | '\u{F0000}'..='\u{10FFFF}'
    )
}

/// ASCII whitespace separates words; every other separator, control or format
/// character is removed outright.
fn is_printable(c: char) -> bool {
    if c.is_ascii() {
        return !c.is_ascii_control() || c.is_ascii_whitespace();
    }
    !(c.is_control() || c.is_whitespace() || is_format_or_private(c))
}

/// Drops non-printable characters, collapses whitespace runs and truncates to
/// `max_chars` characters.
pub fn sanitize_text(text: &str, max_chars: usize) -> Result<String> {
    let printable = text.chars().filter(|c| is_printable(*c)).collect::<String>();
    let collapsed = printable.split_ascii_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        bail!("text is empty after removing non-printable characters");
    }

    let count = collapsed.chars().count();
    if count <= max_chars {
        return Ok(collapsed);
    }
    tracing::warn!(chars = count, max_chars, "truncating text for speech synthesis");
    Ok(collapsed
        .chars()
        .take(max_chars)
        .collect::<String>()
        .trim_end()
        .to_owned())
}

#[derive(Debug, Deserialize)]
struct VoicemakerResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TtsClient {
    http: Client,
    name: String,
    provider: TtsProviderConfig,
    api_key: Option<String>,
    cache_dir: Option<PathBuf>,
    max_chars: usize,
}

impl TtsClient {
    pub fn new(
        http: Client,
        name: &str,
        provider: TtsProviderConfig,
        api_key: Option<String>,
        cache_dir: Option<PathBuf>,
        max_chars: usize,
    ) -> Self {
        Self {
            http,
            name: name.to_owned(),
            provider,
            api_key,
            cache_dir,
            max_chars,
        }
    }

    /// Builds the client for `provider` (or the configured default), reading its key from
    /// the environment.
    pub fn from_config(config: &TtsConfig, provider: Option<&str>) -> Result<Self> {
        let name = provider.unwrap_or(&config.default_provider);
        let provider = config.providers.get(name).cloned().ok_or_else(|| {
            let known = config.providers.keys().cloned().collect::<Vec<_>>();
            anyhow!(CodedError::usage(
                UNKNOWN_TTS_PROVIDER,
                format!("unknown TTS provider '{name}'"),
            )
            .with_details(serde_json::json!({ "known": known })))
        })?;
        let key = provider.api_key_env.as_deref().map(api_key).transpose()?;
        Ok(Self::new(
            build_client(config.timeout_secs)?,
            name,
            provider,
            key,
            config.cache_dir.clone(),
            config.max_chars,
        ))
    }

    fn payload(&self, text: &str) -> Map<String, Value> {
        let mut payload = self.provider.payload.clone();
        payload.insert(
            self.provider.text_field().to_owned(),
            Value::String(text.to_owned()),
        );
        payload
    }

    fn cache_path(&self, payload: &Map<String, Value>) -> Option<PathBuf> {
        let dir = self.cache_dir.as_ref()?;
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update([0]);
        hasher.update(Value::Object(payload.clone()).to_string().as_bytes());
        Some(dir.join(format!("{:x}.audio", hasher.finalize())))
    }

    /// Synthesizes `text` and returns the audio bytes.
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let text = sanitize_text(text, self.max_chars)?;
        let payload = self.payload(&text);

        let cache_path = self.cache_path(&payload);
        if let Some(path) = cache_path.as_ref().filter(|path| path.is_file()) {
            tracing::debug!(path = %path.display(), "tts cache hit");
            return tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read cached audio {}", path.display()));
        }

        let audio = match self.provider.kind {
            TtsProviderKind::Voicemaker => self.voicemaker(&payload).await?,
            TtsProviderKind::Raw => self.raw(&payload).await?,
        };

        if let Some(path) = cache_path {
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("failed to create cache dir {}", dir.display()))?;
            }
            write_atomic(&path, &audio)?;
        }
        Ok(audio)
    }

    async fn voicemaker(&self, payload: &Map<String, Value>) -> Result<Vec<u8>> {
        let mut request = self.http.post(&self.provider.url).json(payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .context("failed to call Voicemaker API")?;
        let status = response.status();
        let body = response
            .text()
            .await
            .context("failed to read Voicemaker response")?;
        let parsed = serde_json::from_str::<VoicemakerResponse>(&body).ok();
        let message = parsed
            .as_ref()
            .and_then(|parsed| parsed.message.clone())
            .unwrap_or_else(|| last_n_chars(&body, 300));

        if message.to_ascii_lowercase().contains("character limit") {
            return Err(anyhow!(CharacterLimitError { message }));
        }
        if !status.is_success() {
            bail!("Voicemaker API returned {status}: {message}");
        }
        let parsed = parsed.ok_or_else(|| anyhow!("Voicemaker API returned non-JSON body: {message}"))?;
        if !parsed.success {
            bail!("Voicemaker API reported failure: {message}");
        }
        let audio_url = parsed
            .path
            .filter(|path| !path.is_empty())
            .ok_or_else(|| anyhow!("Voicemaker response has no audio path"))?;

        let response = self
            .http
            .get(&audio_url)
            .send()
            .await
            .with_context(|| format!("failed to download {audio_url}"))?;
        let bytes = ensure_success(response, "Voicemaker audio download")
            .await?
            .bytes()
            .await
            .context("failed to read Voicemaker audio")?;
        Ok(bytes.to_vec())
    }

    async fn raw(&self, payload: &Map<String, Value>) -> Result<Vec<u8>> {
        let mut request = self.http.post(&self.provider.url).json(payload);
        for (name, value) in &self.provider.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("failed to call TTS provider '{}'", self.name))?;
        let bytes = ensure_success(response, &format!("TTS provider '{}'", self.name))
            .await?
            .bytes()
            .await
            .context("failed to read TTS audio")?;
        if bytes.is_empty() {
            bail!("TTS provider '{}' returned an empty body", self.name);
        }
        Ok(bytes.to_vec())
    }

    pub async fn speak_to_file(&self, text: &str, output: &Path) -> Result<()> {
        let audio = self.synthesize(text).await?;
        write_atomic(output, &audio)
    }
}

/// `<stem>_transcript.txt` -> `<stem>_transcript.mp3` next to it.
pub async fn speak_tree(client: &TtsClient, config: &Config, root: &Path) -> Result<BatchReport> {
    let skip = SkipPattern::new(&config.walk.skip_dir_pattern);
    let mut report = BatchReport::new("speak");

    let transcripts = files_with_extension(root, &["txt"], true, &skip)?
        .into_iter()
        .filter(|path| {
            path.file_name()
                .is_some_and(|name| name.to_string_lossy().ends_with("_transcript.txt"))
        });
    for transcript in transcripts {
        let output = transcript.with_extension("mp3");
        if output.exists() {
            report.skipped(&transcript, "audio exists");
            continue;
        }
        let result = match tokio::fs::read_to_string(&transcript).await {
            Ok(text) => client.speak_to_file(&text, &output).await,
            Err(error) => Err(anyhow!(error).context("failed to read transcript")),
        };
        match result {
            Ok(()) => report.ok(&transcript, output.display().to_string()),
            Err(error) if is_character_limit(&error) => {
                report.failed(&transcript, &error);
                report.stop("TTS character limit reached");
                break;
            }
            Err(error) => report.failed(&transcript, &error),
        }
    }

    Ok(report)
}

/// Each slide of a slides JSON file -> `<json dir>/output/<clean name>.mp3`.
pub async fn speak_slides(
    client: &TtsClient,
    slides_path: &Path,
    field: SlideField,
) -> Result<BatchReport> {
    let slides = load_slides(slides_path)?;
    let output_dir = slides_output_dir(slides_path);
    tokio::fs::create_dir_all(&output_dir)
        .await
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    let mut report = BatchReport::new("speak-slides");
    for slide in &slides {
        let output = output_dir.join(format!("{}.mp3", clean_filename(&slide.name)));
        if output.exists() {
            report.skipped(&output, "audio exists");
            continue;
        }
        let text = field.text(slide).replace("\\n", "");
        match client.speak_to_file(&text, &output).await {
            Ok(()) => report.ok(&output, slide.name.clone()),
            Err(error) if is_character_limit(&error) => {
                report.failed(&output, &error);
                report.stop("TTS character limit reached");
                break;
            }
            Err(error) => report.failed(&output, &error),
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;

    use serde_json::{json, Map};
    use tempfile::tempdir;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{is_character_limit, sanitize_text, TtsClient};
    use crate::config::{TtsProviderConfig, TtsProviderKind};
    use crate::http::build_client;

    fn provider(kind: TtsProviderKind, url: String) -> TtsProviderConfig {
        let payload = match json!({"VoiceId": "ai3-Jony", "OutputFormat": "mp3"}) {
            serde_json::Value::Object(map) => map,
            _ => Map::new(),
        };
        TtsProviderConfig {
            kind,
            url,
            api_key_env: None,
            headers: BTreeMap::from([("X-Voice".to_owned(), "narrator".to_owned())]),
            payload,
            text_field: None,
        }
    }

    fn client(kind: TtsProviderKind, url: String, cache: Option<&std::path::Path>) -> TtsClient {
        TtsClient::new(
            build_client(10).expect("client should build"),
            "test",
            provider(kind, url),
            Some("secret".to_owned()),
            cache.map(std::path::Path::to_path_buf),
            1000,
        )
    }

    #[test]
    fn sanitize_collapses_whitespace_and_strips_control_chars() {
        let text = "  Hello\u{7}\n\n  world\t again  ";
        assert_eq!(sanitize_text(text, 100).expect("text should sanitize"), "Hello world again");
        assert_eq!(sanitize_text("abcdef ghi", 8).expect("text should sanitize"), "abcdef g");
        assert_eq!(sanitize_text("abcdef ghi", 7).expect("text should sanitize"), "abcdef");
        assert!(sanitize_text(" \u{1}\u{2} ", 10).is_err());
    }

    #[test]
    fn sanitize_drops_invisible_and_non_ascii_separators() {
        let text = "\u{FEFF}Zero\u{200B}width\u{00A0}space\u{2028} and\u{00AD} tags\u{E0041}";
        assert_eq!(
            sanitize_text(text, 100).expect("text should sanitize"),
            "Zerowidthspace and tags"
        );
        assert_eq!(
            sanitize_text("コンベヤ\u{3000}システム", 100).expect("text should sanitize"),
            "コンベヤシステム"
        );
        assert!(sanitize_text("\u{200B}\u{FEFF}", 10).is_err());
    }

    #[tokio::test]
    async fn voicemaker_downloads_returned_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/voice/api"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({"Text": "Hello there", "VoiceId": "ai3-Jony"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "path": format!("{}/files/out.mp3", server.uri())
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/out.mp3"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"MP3DATA".to_vec()))
            .mount(&server)
            .await;

        let client = client(
            TtsProviderKind::Voicemaker,
            format!("{}/voice/api", server.uri()),
            None,
        );
        let audio = client
            .synthesize("Hello\n   there")
            .await
            .expect("synthesis should succeed");
        assert_eq!(audio, b"MP3DATA");
    }

    #[tokio::test]
    async fn voicemaker_character_limit_is_distinguished() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "success": false,
                "message": "Character limit exceeded for this month"
            })))
            .mount(&server)
            .await;

        let client = client(TtsProviderKind::Voicemaker, server.uri(), None);
        let error = client
            .synthesize("anything")
            .await
            .expect_err("quota error should fail");
        assert!(is_character_limit(&error));

        let plain = anyhow::anyhow!("timeout");
        assert!(!is_character_limit(&plain));
    }

    #[tokio::test]
    async fn raw_provider_returns_body_and_uses_cache() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-voice", "narrator"))
            .and(body_partial_json(json!({"text": "Cached line"})))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"RIFFWAVE".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().expect("tempdir should be created");
        let cache = dir.path().join("cache");
        let client = client(TtsProviderKind::Raw, server.uri(), Some(&cache));
        let first = client.synthesize("Cached line").await.expect("first call should succeed");
        let second = client.synthesize("Cached line").await.expect("cache hit should succeed");
        assert_eq!(first, b"RIFFWAVE");
        assert_eq!(second, first);
        assert_eq!(fs::read_dir(&cache).expect("cache dir should exist").count(), 1);
    }
}
