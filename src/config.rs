use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error_codes::{CodedError, INVALID_CONFIG, MISSING_API_KEY};

pub const DEFAULT_CONFIG_FILE: &str = "clipbatch.yaml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub tools: ToolsConfig,
    pub walk: WalkConfig,
    pub encode: EncodeConfig,
    pub merge: MergeConfig,
    pub presentation: PresentationConfig,
    pub intro: IntroConfig,
    pub transcription: TranscriptionConfig,
    pub tts: TtsConfig,
    pub sharepoint: SharePointConfig,
    pub upload: UploadConfig,
}

impl Config {
    /// Loads `path`, or `clipbatch.yaml` from the working directory when no path is
    /// given. Only an explicitly named file is required to exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        if !path.exists() {
            if required {
                return Err(anyhow!(CodedError::usage(
                    crate::error_codes::MISSING_INPUT,
                    format!("config file not found: {}", path.display()),
                )));
            }
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::from_yaml_str(&contents).map_err(|error| {
            error.context(format!("invalid config file {}", path.display()))
        })?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents).map_err(|error| {
            let location = error
                .location()
                .map(|location| format!("line {}, column {}", location.line(), location.column()))
                .unwrap_or_else(|| "unknown location".to_owned());
            anyhow!(CodedError::usage(
                INVALID_CONFIG,
                format!("failed to parse yaml at {}: {}", location, error),
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.intro.validate()?;
        self.presentation.validate()?;
        self.tts.validate()?;
        if self.walk.skip_dir_pattern.trim().is_empty() {
            return Err(invalid("walk.skip_dir_pattern cannot be empty"));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> anyhow::Error {
    anyhow!(CodedError::usage(INVALID_CONFIG, message))
}

/// Reads a secret from the named environment variable.
pub fn api_key(env_name: &str) -> Result<String> {
    match env::var(env_name) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_owned()),
        _ => Err(anyhow!(CodedError::usage(
            MISSING_API_KEY,
            format!("environment variable {env_name} is not set"),
        )
        .with_details(json!({ "env": env_name })))),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolMode {
    #[default]
    Auto,
    System,
    Sidecar,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ToolsConfig {
    pub ffmpeg: Option<PathBuf>,
    pub ffprobe: Option<PathBuf>,
    pub mode: ToolMode,
}

impl ToolsConfig {
    pub fn ffmpeg(&self) -> Result<PathBuf> {
        self.resolve("ffmpeg", self.ffmpeg.as_deref())
    }

    pub fn ffprobe(&self) -> Result<PathBuf> {
        self.resolve("ffprobe", self.ffprobe.as_deref())
    }

    fn resolve(&self, name: &str, explicit: Option<&Path>) -> Result<PathBuf> {
        match self.mode {
            ToolMode::Sidecar => sidecar_path(name),
            ToolMode::System => Ok(explicit
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(name))),
            ToolMode::Auto => {
                if let Some(path) = explicit {
                    return Ok(path.to_path_buf());
                }
                if let Some(path) = home_bin(name).filter(|path| path.is_file()) {
                    return Ok(path);
                }
                Ok(PathBuf::from(name))
            }
        }
    }
}

fn home_bin(name: &str) -> Option<PathBuf> {
    let home = env::var_os("HOME").or_else(|| env::var_os("USERPROFILE"))?;
    let file_name = if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_owned()
    };
    Some(PathBuf::from(home).join("bin").join(file_name))
}

#[cfg(feature = "sidecar_ffmpeg")]
fn sidecar_path(name: &str) -> Result<PathBuf> {
    let ffmpeg = ffmpeg_sidecar::paths::ffmpeg_path();
    if !ffmpeg.exists() {
        ffmpeg_sidecar::download::auto_download()
            .context("failed to auto-download ffmpeg sidecar binary")?;
    }
    match name {
        "ffprobe" => Ok(ffmpeg_sidecar::ffprobe::ffprobe_path()),
        _ => Ok(ffmpeg),
    }
}

#[cfg(not(feature = "sidecar_ffmpeg"))]
fn sidecar_path(_name: &str) -> Result<PathBuf> {
    Err(anyhow!(CodedError::usage(
        crate::error_codes::UNSUPPORTED_OPTION,
        "tools.mode is 'sidecar' but clipbatch was built without `sidecar_ffmpeg`. Rebuild with `--features sidecar_ffmpeg`.",
    )))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WalkConfig {
    /// Directories whose name contains this (case-insensitive) are not visited.
    pub skip_dir_pattern: String,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            skip_dir_pattern: "backup".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EncodeConfig {
    pub video_codec: String,
    pub preset: String,
    pub crf: u32,
    pub audio_codec: String,
    pub audio_bitrate: String,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            video_codec: "libx264".to_owned(),
            preset: "superfast".to_owned(),
            crf: 23,
            audio_codec: "aac".to_owned(),
            audio_bitrate: "192k".to_owned(),
        }
    }
}

impl EncodeConfig {
    pub fn output_args(&self) -> Vec<String> {
        vec![
            "-c:v".to_owned(),
            self.video_codec.clone(),
            "-preset".to_owned(),
            self.preset.clone(),
            "-crf".to_owned(),
            self.crf.to_string(),
            "-c:a".to_owned(),
            self.audio_codec.clone(),
            "-b:a".to_owned(),
            self.audio_bitrate.clone(),
            "-movflags".to_owned(),
            "+faststart".to_owned(),
        ]
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MergeConfig {
    pub output: String,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            output: "output.mp4".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PresentationConfig {
    pub intro: String,
    pub body: String,
    pub output: String,
    pub width: u32,
    pub height: u32,
    pub fade_secs: f64,
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self {
            intro: "global_props.mp4".to_owned(),
            body: "output.mp4".to_owned(),
            output: "presentation.mp4".to_owned(),
            width: 1920,
            height: 1080,
            fade_secs: 1.0,
        }
    }
}

impl PresentationConfig {
    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(invalid(format!(
                "presentation size must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if !self.fade_secs.is_finite() || self.fade_secs < 0.0 {
            return Err(invalid("presentation.fade_secs must be >= 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TextStyleConfig {
    pub min_size: f32,
    pub max_size: f32,
    pub color: String,
    /// Height of the element box the text must fit into.
    pub box_height: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TimestampStyleConfig {
    pub size: f32,
    pub color: String,
    pub line_spacing: f32,
}

impl Default for TimestampStyleConfig {
    fn default() -> Self {
        Self {
            size: 28.0,
            color: "#111827".to_owned(),
            line_spacing: 1.4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IntroConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub duration_secs: f64,
    pub font_path: Option<PathBuf>,
    pub output: String,
    pub margin: f32,
    pub padding: f32,
    pub image_width_percentage: f32,
    pub element_gap: f32,
    pub fade_secs: f64,
    pub stagger_secs: f64,
    pub background: String,
    pub panel: String,
    pub title: TextStyleConfig,
    pub subtitle: TextStyleConfig,
    pub timestamps: TimestampStyleConfig,
}

impl Default for TextStyleConfig {
    fn default() -> Self {
        Self {
            min_size: 28.0,
            max_size: 96.0,
            color: "#1F2937".to_owned(),
            box_height: 220.0,
        }
    }
}

impl Default for IntroConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            duration_secs: 8.0,
            font_path: None,
            output: "global_props.mp4".to_owned(),
            margin: 40.0,
            padding: 50.0,
            image_width_percentage: 35.0,
            element_gap: 24.0,
            fade_secs: 0.8,
            stagger_secs: 0.5,
            background: "#FFFFFF".to_owned(),
            panel: "#C8C8C8".to_owned(),
            title: TextStyleConfig::default(),
            subtitle: TextStyleConfig {
                min_size: 18.0,
                max_size: 48.0,
                color: "#4B5563".to_owned(),
                box_height: 120.0,
            },
            timestamps: TimestampStyleConfig::default(),
        }
    }
}

impl IntroConfig {
    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(invalid(format!(
                "intro size must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if self.fps == 0 {
            return Err(invalid("intro.fps must be > 0"));
        }
        if !self.duration_secs.is_finite() || self.duration_secs <= 0.0 {
            return Err(invalid("intro.duration_secs must be > 0"));
        }
        if !(0.0..100.0).contains(&self.image_width_percentage) {
            return Err(invalid(
                "intro.image_width_percentage must be in [0, 100)",
            ));
        }
        if self.fade_secs < 0.0 || self.stagger_secs < 0.0 {
            return Err(invalid("intro fade and stagger must be >= 0"));
        }
        for (label, style) in [("title", &self.title), ("subtitle", &self.subtitle)] {
            if style.min_size <= 0.0 || style.min_size > style.max_size {
                return Err(invalid(format!(
                    "intro.{label}: need 0 < min_size <= max_size, got {} and {}",
                    style.min_size, style.max_size
                )));
            }
        }
        if self.timestamps.size <= 0.0 {
            return Err(invalid("intro.timestamps.size must be > 0"));
        }
        for color in [
            &self.background,
            &self.panel,
            &self.title.color,
            &self.subtitle.color,
            &self.timestamps.color,
        ] {
            parse_hex_color(color)?;
        }
        Ok(())
    }
}

/// Parses `#RRGGBB` or `#RRGGBBAA`.
pub fn parse_hex_color(raw: &str) -> Result<[u8; 4]> {
    let hex = raw.trim().trim_start_matches('#');
    if !(hex.len() == 6 || hex.len() == 8) || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid(format!(
            "invalid color '{raw}': expected #RRGGBB or #RRGGBBAA"
        )));
    }
    let channel = |index: usize| u8::from_str_radix(&hex[index..index + 2], 16);
    let alpha = if hex.len() == 8 { channel(6)? } else { 255 };
    Ok([channel(0)?, channel(2)?, channel(4)?, alpha])
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TranscriptionConfig {
    pub base_url: String,
    pub model: String,
    pub api_key_env: String,
    pub extensions: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_owned(),
            model: "whisper-1".to_owned(),
            api_key_env: "OPENAI_API_KEY".to_owned(),
            extensions: vec!["mp3".to_owned()],
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsProviderKind {
    Voicemaker,
    Raw,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TtsProviderConfig {
    pub kind: TtsProviderKind,
    pub url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub text_field: Option<String>,
}

impl TtsProviderConfig {
    pub fn text_field(&self) -> &str {
        match (&self.text_field, self.kind) {
            (Some(field), _) => field,
            (None, TtsProviderKind::Voicemaker) => "Text",
            (None, TtsProviderKind::Raw) => "text",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TtsConfig {
    pub default_provider: String,
    pub max_chars: usize,
    pub cache_dir: Option<PathBuf>,
    pub timeout_secs: u64,
    pub providers: BTreeMap<String, TtsProviderConfig>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        let payload = json!({
            "Engine": "neural",
            "VoiceId": "pro1-Thomas",
            "LanguageCode": "en-US",
            "OutputFormat": "mp3",
            "SampleRate": "48000",
            "Effect": "default",
            "MasterVolume": "0",
            "MasterSpeed": "0",
            "MasterPitch": "0",
            "FileStore": "24"
        });
        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        let mut providers = BTreeMap::new();
        providers.insert(
            "voicemaker".to_owned(),
            TtsProviderConfig {
                kind: TtsProviderKind::Voicemaker,
                url: "https://developer.voicemaker.in/voice/api".to_owned(),
                api_key_env: Some("VOICEMAKER_API_KEY".to_owned()),
                headers: BTreeMap::new(),
                payload,
                text_field: None,
            },
        );

        Self {
            default_provider: "voicemaker".to_owned(),
            max_chars: 1000,
            cache_dir: None,
            timeout_secs: 120,
            providers,
        }
    }
}

impl TtsConfig {
    fn validate(&self) -> Result<()> {
        if self.max_chars == 0 {
            return Err(invalid("tts.max_chars must be > 0"));
        }
        if !self.providers.contains_key(&self.default_provider) {
            return Err(invalid(format!(
                "tts.default_provider '{}' is not defined under tts.providers",
                self.default_provider
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SharePointConfig {
    pub site_url: Option<String>,
    pub token_env: String,
    pub timeout_secs: u64,
}

impl Default for SharePointConfig {
    fn default() -> Self {
        Self {
            site_url: None,
            token_env: "SHAREPOINT_ACCESS_TOKEN".to_owned(),
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct UploadConfig {
    pub url: Option<String>,
    pub token_env: Option<String>,
}
